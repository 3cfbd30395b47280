use crate::{
    Category, ErrorKind, Granularity, LimiterKey, LimiterRule, OverageRecord, QuotaDecision,
    TollgateError, WindowBucket, WindowSeconds, MAX_KEY_LEN, MAX_WINDOW_SECONDS,
};

fn key(s: &str) -> LimiterKey {
    LimiterKey::try_from(s).unwrap()
}

#[test]
fn window_seconds_try_from_validates_min_1() {
    let w = WindowSeconds::try_from(1u64).unwrap();
    assert_eq!(*w, 1u64);

    let err = WindowSeconds::try_from(0u64).unwrap_err();
    assert!(matches!(
        err,
        TollgateError::InvalidWindow(ref msg) if msg == "Window must be at least 1 second"
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert!(WindowSeconds::try_from(u64::MAX).is_err());
}

#[test]
fn window_seconds_is_capped_below_the_store_expiry_limit() {
    let longest = WindowSeconds::try_from(MAX_WINDOW_SECONDS).unwrap();
    assert_eq!(*longest, MAX_WINDOW_SECONDS);

    let err = WindowSeconds::try_from(MAX_WINDOW_SECONDS + 1).unwrap_err();
    assert!(matches!(err, TollgateError::InvalidWindow(_)));
    assert!(WindowSeconds::try_from(i64::MAX as u64).is_err());

    // the end of any bucket stays representable in milliseconds
    let now_s = 1_707_998_400_i64;
    let end = (now_s + MAX_WINDOW_SECONDS as i64).checked_mul(1000);
    assert!(end.is_some());

    let bucket = WindowBucket::at(Category::Custom, now_s, Some(longest)).unwrap();
    assert_eq!(bucket.start, 0);
    assert_eq!(bucket.end, MAX_WINDOW_SECONDS as i64);
}

#[test]
fn category_round_trips_wire_names() {
    for category in Category::ALL {
        assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        assert_eq!(category.to_string(), category.as_str());
    }

    assert!(matches!(
        "WEEK".parse::<Category>(),
        Err(TollgateError::InvalidRule(_))
    ));
    assert!("second".parse::<Category>().is_err());
}

#[test]
fn category_order_is_evaluation_order() {
    let mut shuffled = vec![
        Category::Custom,
        Category::Day,
        Category::Second,
        Category::Year,
        Category::Minute,
        Category::Month,
        Category::Hour,
    ];
    shuffled.sort();

    assert_eq!(shuffled, Category::ALL.to_vec());
    assert_eq!(Category::Minute.fixed_length_seconds(), Some(60));
    assert_eq!(Category::Month.fixed_length_seconds(), None);
}

#[test]
fn limiter_key_joins_segments_with_separator() {
    let k = LimiterKey::from_segments(["api", "user1"]).unwrap();
    assert_eq!(&*k, "api/user1");
    assert_eq!(k.segments().collect::<Vec<_>>(), vec!["api", "user1"]);
    assert_eq!(k, key("api/user1"));
}

#[test]
fn limiter_key_rejects_bad_segments() {
    let empty: [&str; 0] = [];
    assert!(matches!(
        LimiterKey::from_segments(empty),
        Err(TollgateError::InvalidKey(_))
    ));
    assert!(LimiterKey::from_segments(["api", ""]).is_err());
    assert!(LimiterKey::from_segments(["a/b"]).is_err());
    assert!(LimiterKey::try_from("api//user").is_err());

    let long = "x".repeat(MAX_KEY_LEN + 1);
    assert!(LimiterKey::from_segments([long.as_str()]).is_err());

    let max = "x".repeat(MAX_KEY_LEN);
    assert!(LimiterKey::from_segments([max.as_str()]).is_ok());
}

#[test]
fn limiter_rule_sorts_by_category() {
    let rule = LimiterRule::new(
        key("k"),
        vec![
            Granularity::new(Category::Day, 1000),
            Granularity::new(Category::Second, 5),
            Granularity::custom(WindowSeconds::try_from(30).unwrap(), 50),
            Granularity::new(Category::Minute, 100),
        ],
    )
    .unwrap();

    let categories: Vec<_> = rule.granularities.iter().map(|g| g.category).collect();
    assert_eq!(
        categories,
        vec![
            Category::Second,
            Category::Minute,
            Category::Day,
            Category::Custom
        ]
    );
    assert_eq!(rule.granularity(Category::Minute).unwrap().max_amount, 100);
    assert!(rule.granularity(Category::Hour).is_none());
    assert_eq!(rule.as_of_ms, None);
}

#[test]
fn limiter_rule_rejects_duplicates_and_misplaced_windows() {
    let duplicate = LimiterRule::new(
        key("k"),
        vec![
            Granularity::new(Category::Second, 5),
            Granularity::new(Category::Second, 6),
        ],
    );
    assert!(matches!(duplicate, Err(TollgateError::InvalidRule(_))));

    let custom_without_window = LimiterRule::new(
        key("k"),
        vec![Granularity {
            window: None,
            ..Granularity::custom(WindowSeconds::try_from(10).unwrap(), 1)
        }],
    );
    assert!(custom_without_window.is_err());

    let second_with_window = LimiterRule::new(
        key("k"),
        vec![Granularity {
            window: Some(WindowSeconds::try_from(10).unwrap()),
            ..Granularity::new(Category::Second, 1)
        }],
    );
    assert!(second_with_window.is_err());

    assert!(LimiterRule::new(key("k"), Vec::new()).is_ok());
}

#[test]
fn snapshot_sorts_by_max_amount_then_category() {
    let rule = LimiterRule::snapshot(
        key("k"),
        vec![
            Granularity::new(Category::Second, 100),
            Granularity::new(Category::Hour, 10),
            Granularity::new(Category::Minute, 10),
        ],
        1_000,
    );

    let order: Vec<_> = rule
        .granularities
        .iter()
        .map(|g| (g.category, g.max_amount))
        .collect();
    assert_eq!(
        order,
        vec![
            (Category::Minute, 10),
            (Category::Hour, 10),
            (Category::Second, 100)
        ]
    );
    assert_eq!(rule.as_of_ms, Some(1_000));
}

#[test]
fn quota_decision_is_accepted() {
    assert!(QuotaDecision::Accepted.is_accepted());
    assert!(QuotaDecision::AcceptedNoRule.is_accepted());
    assert!(
        !QuotaDecision::Rejected {
            category: Category::Second,
            current_amount: 5,
            overage_count: 1,
        }
        .is_accepted()
    );
}

#[test]
fn overage_field_names_parse() {
    assert_eq!(
        OverageRecord::parse_field("CUSTOM_1700000000"),
        Some((Category::Custom, 1_700_000_000))
    );

    assert_eq!(OverageRecord::parse_field("SECOND_-60"), Some((Category::Second, -60)));
    assert_eq!(OverageRecord::parse_field("SECOND"), None);
    assert_eq!(OverageRecord::parse_field("WEEK_10"), None);
    assert_eq!(OverageRecord::parse_field("SECOND_abc"), None);
}

#[test]
fn error_kinds() {
    assert_eq!(TollgateError::PoolClosed.kind(), ErrorKind::Transport);
    assert_eq!(
        TollgateError::MalformedReply(String::new()).kind(),
        ErrorKind::Protocol
    );
    assert_eq!(
        TollgateError::Startup(Box::new(TollgateError::PoolClosed)).kind(),
        ErrorKind::Configuration
    );
    assert_eq!(
        TollgateError::InvalidPattern(String::new()).kind(),
        ErrorKind::InvalidInput
    );
}
