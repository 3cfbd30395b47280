use std::path::PathBuf;

use redis::Script;

use crate::TollgateError;

/// Name of the check-and-increment script.
pub const LIMITER_SCRIPT_NAME: &str = "limiter.lua";
/// Name of the rule replacement script.
pub const LIMITER_RULE_BATCH_SET_SCRIPT_NAME: &str = "limiter_rule_batch_set.lua";
/// Name of the rule query script.
pub const LIMITER_RULE_QUERY_SCRIPT_NAME: &str = "limiter_rule_query.lua";

const EMBEDDED: [(&str, &str); 3] = [
    (LIMITER_SCRIPT_NAME, include_str!("scripts/limiter.lua")),
    (
        LIMITER_RULE_BATCH_SET_SCRIPT_NAME,
        include_str!("scripts/limiter_rule_batch_set.lua"),
    ),
    (
        LIMITER_RULE_QUERY_SCRIPT_NAME,
        include_str!("scripts/limiter_rule_query.lua"),
    ),
];

/// Where script bodies are read from at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ScriptSource {
    /// The bodies compiled into this crate.
    #[default]
    Embedded,
    /// `<dir>/limiter.lua`, `<dir>/limiter_rule_batch_set.lua` and
    /// `<dir>/limiter_rule_query.lua`.
    Directory(PathBuf),
}

/// Body of an embedded script by name.
pub fn embedded_script(name: &str) -> Option<&'static str> {
    EMBEDDED
        .iter()
        .find(|(embedded_name, _)| *embedded_name == name)
        .map(|(_, body)| *body)
}

/// The three Lua procedures the limiter runs, loaded once at startup.
///
/// Each is sent with `EVALSHA` and transparently re-sent with `EVAL` if the
/// server does not have it cached.
#[derive(Clone, Debug)]
pub struct ScriptSet {
    pub(crate) limiter: Script,
    pub(crate) rule_batch_set: Script,
    pub(crate) rule_query: Script,
}

impl ScriptSet {
    /// Load every named script from `source`.
    ///
    /// A missing or unreadable file fails the whole load.
    pub fn load(source: &ScriptSource) -> Result<Self, TollgateError> {
        Ok(Self {
            limiter: Script::new(&Self::body(source, LIMITER_SCRIPT_NAME)?),
            rule_batch_set: Script::new(&Self::body(
                source,
                LIMITER_RULE_BATCH_SET_SCRIPT_NAME,
            )?),
            rule_query: Script::new(&Self::body(source, LIMITER_RULE_QUERY_SCRIPT_NAME)?),
        })
    }

    /// The scripts compiled into this crate.
    pub fn embedded() -> Self {
        let script = |name| Script::new(embedded_script(name).unwrap_or_default());

        Self {
            limiter: script(LIMITER_SCRIPT_NAME),
            rule_batch_set: script(LIMITER_RULE_BATCH_SET_SCRIPT_NAME),
            rule_query: script(LIMITER_RULE_QUERY_SCRIPT_NAME),
        }
    }

    /// SHA1 of the check-and-increment script, as Redis caches it.
    pub fn limiter_hash(&self) -> &str {
        self.limiter.get_hash()
    }

    fn body(source: &ScriptSource, name: &str) -> Result<String, TollgateError> {
        match source {
            ScriptSource::Embedded => embedded_script(name).map(str::to_string).ok_or_else(|| {
                TollgateError::ScriptLoad {
                    name: name.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no embedded script with this name",
                    ),
                }
            }),
            ScriptSource::Directory(dir) => {
                let path = dir.join(name);
                let body =
                    std::fs::read_to_string(&path).map_err(|source| TollgateError::ScriptLoad {
                        name: name.to_string(),
                        source,
                    })?;

                tracing::debug!(script = name, path = %path.display(), "redis.script.loaded");
                Ok(body)
            }
        }
    }
}
