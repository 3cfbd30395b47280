//! Decoding of script replies.
//!
//! Every shape check is strict: an unexpected reply is a
//! [`TollgateError::MalformedReply`], never a partial result.

use redis::Value;

use crate::{
    Category, Granularity, LimiterKey, LimiterRule, OverageRecord, QuotaDecision, TollgateError,
    WindowSeconds,
};

fn malformed(message: impl Into<String>) -> TollgateError {
    TollgateError::MalformedReply(message.into())
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Okay => Some("OK".to_string()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Int(n) => u64::try_from(*n).ok(),
        Value::BulkString(_) | Value::SimpleString(_) => as_string(value)?.parse().ok(),
        _ => None,
    }
}

fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a [Value], TollgateError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(malformed(format!("expected array for {what}, got {other:?}"))),
    }
}

/// Decode the reply of the check-and-increment script.
///
/// `{"OK"}`, `{"NORULE"}` or `{"FULL", category, current, overage}`.
pub(crate) fn parse_limiter_reply(value: &Value) -> Result<QuotaDecision, TollgateError> {
    let items = as_array(value, "limiter reply")?;

    let tag = items
        .first()
        .and_then(as_string)
        .ok_or_else(|| malformed("empty limiter reply"))?;

    match (tag.as_str(), items.len()) {
        ("OK", 1) => Ok(QuotaDecision::Accepted),
        ("NORULE", 1) => Ok(QuotaDecision::AcceptedNoRule),
        ("FULL", 4) => {
            let category = as_string(&items[1])
                .and_then(|s| s.parse::<Category>().ok())
                .ok_or_else(|| malformed(format!("bad category in {items:?}")))?;
            let current_amount =
                as_u64(&items[2]).ok_or_else(|| malformed(format!("bad current in {items:?}")))?;
            let overage_count =
                as_u64(&items[3]).ok_or_else(|| malformed(format!("bad overage in {items:?}")))?;

            Ok(QuotaDecision::Rejected {
                category,
                current_amount,
                overage_count,
            })
        }
        _ => Err(malformed(format!("unexpected limiter reply {items:?}"))),
    }
}

/// Decode the reply of the rule batch-set script.
pub(crate) fn parse_batch_set_reply(value: &Value) -> Result<(), TollgateError> {
    match value {
        Value::Int(1) | Value::Okay | Value::Boolean(true) => Ok(()),
        other => Err(malformed(format!("unexpected rule set reply {other:?}"))),
    }
}

fn parse_granularity(value: &Value) -> Result<Granularity, TollgateError> {
    let items = as_array(value, "granularity")?;
    if items.len() != 3 && items.len() != 4 {
        return Err(malformed(format!("granularity has {} fields", items.len())));
    }

    let category: Category = as_string(&items[0])
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(format!("bad category in {items:?}")))?;
    let max_amount =
        as_u64(&items[1]).ok_or_else(|| malformed(format!("bad max amount in {items:?}")))?;
    let now_amount =
        as_u64(&items[2]).ok_or_else(|| malformed(format!("bad now amount in {items:?}")))?;

    let window = match items.get(3) {
        Some(raw) => Some(
            as_u64(raw)
                .and_then(|length| WindowSeconds::try_from(length).ok())
                .ok_or_else(|| malformed(format!("bad window in {items:?}")))?,
        ),
        None => None,
    };

    match (category, window) {
        (Category::Custom, None) => Err(malformed("CUSTOM granularity without window")),
        (category, Some(_)) if category != Category::Custom => {
            Err(malformed(format!("{category} granularity with window")))
        }
        _ => Ok(Granularity {
            category,
            max_amount,
            now_amount: Some(now_amount),
            window,
        }),
    }
}

/// Decode the reply of the rule query script.
///
/// `{now_ms, key, {{category, max, now[, window]}, ...}, key, ...}`. Rules come
/// back sorted by key.
pub(crate) fn parse_rule_query_reply(value: &Value) -> Result<Vec<LimiterRule>, TollgateError> {
    let items = as_array(value, "rule query reply")?;

    let (now, pairs) = items
        .split_first()
        .ok_or_else(|| malformed("empty rule query reply"))?;
    let as_of_ms = as_u64(now).ok_or_else(|| malformed(format!("bad timestamp {now:?}")))?;

    if pairs.len() % 2 != 0 {
        return Err(malformed("rule query reply has a key without granularities"));
    }

    let mut rules = Vec::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks_exact(2) {
        let raw_key =
            as_string(&pair[0]).ok_or_else(|| malformed(format!("bad key {:?}", pair[0])))?;
        let key = LimiterKey::try_from(raw_key.as_str())
            .map_err(|err| malformed(format!("stored key `{raw_key}`: {err}")))?;

        let granularities = as_array(&pair[1], "granularities")?
            .iter()
            .map(parse_granularity)
            .collect::<Result<Vec<_>, _>>()?;

        rules.push(LimiterRule::snapshot(key, granularities, as_of_ms));
    }

    rules.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(rules)
}

/// Decode an overage ledger hash into records ordered by category then bucket.
pub(crate) fn parse_overages<I>(fields: I) -> Result<Vec<OverageRecord>, TollgateError>
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut records = fields
        .into_iter()
        .map(|(field, count)| {
            let (category, bucket_start) = OverageRecord::parse_field(&field)
                .ok_or_else(|| malformed(format!("bad overage field `{field}`")))?;

            Ok(OverageRecord {
                category,
                bucket_start,
                count,
            })
        })
        .collect::<Result<Vec<_>, TollgateError>>()?;

    records.sort();
    Ok(records)
}
