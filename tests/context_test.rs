mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;

use bbtag::collaborators::{LookupOptions, UserRef};
use bbtag::config::EngineConfig;
use bbtag::context::BBTagContext;
use bbtag::error::Error;
use bbtag::flags::FlagDefinition;
use bbtag::limits::LimitKind;

use common::{host, host_with_config, options, standard_registry};

#[tokio::test]
async fn snapshots_round_trip_identity_and_input() {
    let host = host(standard_registry());
    let mut opts = options(LimitKind::TagLimit);
    opts.input_raw = "-r spam and eggs --count 3".to_string();
    opts.flags = vec![
        FlagDefinition::new('r', "reason", "the reason"),
        FlagDefinition::new('c', "count", "the limit"),
    ];
    opts.tag_name = Some("child".to_string());
    let context = BBTagContext::new(host.engine.clone(), opts);

    let restored = BBTagContext::deserialize(host.engine.clone(), context.serialize())
        .await
        .unwrap();

    assert_eq!(restored.tag_name, "child");
    assert_eq!(restored.root_tag_name, "testtag");
    assert_eq!(restored.author, "u1");
    assert_eq!(restored.input_raw, context.input_raw);
    assert_eq!(restored.input, context.input);
    assert_eq!(restored.flagged_input, context.flagged_input);
    assert_eq!(
        restored.flagged_input.get('r').unwrap().merge().value,
        "spam and eggs"
    );
}

#[tokio::test]
async fn restore_fails_when_the_channel_is_gone() {
    let host = host(standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));
    let snapshot = context.serialize();

    host.util.channels.lock().unwrap().clear();

    let error = BBTagContext::deserialize(host.engine.clone(), snapshot)
        .await
        .err()
        .expect("restore must fail");
    assert!(matches!(error, Error::Restore(_)));
}

#[tokio::test]
async fn restore_fails_for_non_guild_channels() {
    let host = host(standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));
    let snapshot = context.serialize();

    host.util.channels.lock().unwrap()[0].guild_id = None;

    let error = BBTagContext::deserialize(host.engine.clone(), snapshot)
        .await
        .err()
        .expect("restore must fail");
    assert!(matches!(error, Error::Restore(_)));
}

#[tokio::test]
async fn restore_fails_when_the_member_left() {
    let host = host(standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));
    let snapshot = context.serialize();

    host.util.members.lock().unwrap().clear();

    let error = BBTagContext::deserialize(host.engine.clone(), snapshot)
        .await
        .err()
        .expect("restore must fail");
    assert!(matches!(error, Error::Restore(_)));
}

#[tokio::test]
async fn lookup_budget_forces_quiet_mode_once_spent() {
    let config = EngineConfig {
        max_lookup_queries: 2,
        ..Default::default()
    };
    let host = host_with_config(config, standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));

    for query in ["alpha", "beta", "gamma"] {
        let _ = context
            .get_user(query, LookupOptions::default())
            .await
            .unwrap();
    }

    let lookups = host.util.lookups.lock().unwrap();
    assert_eq!(lookups.len(), 3);
    assert!(!lookups[0].suppress);
    assert!(!lookups[1].suppress);
    // Third lookup arrives after the budget is gone.
    assert!(lookups[2].quiet);
    assert!(lookups[2].suppress);
}

#[tokio::test]
async fn repeated_lookups_are_memoized_by_query() {
    let host = host(standard_registry());
    host.util.users.lock().unwrap().push(UserRef {
        id: "u2".to_string(),
        username: "friend".to_string(),
    });
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));

    let first = context
        .get_user("friend", LookupOptions::default())
        .await
        .unwrap()
        .expect("user exists");
    let second = context
        .get_user("friend", LookupOptions::default())
        .await
        .unwrap()
        .expect("user exists");

    assert_eq!(first, second);
    // The second read resolved by id without a fuzzy lookup.
    assert_eq!(host.util.lookups.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn lookup_futures_move_between_worker_threads() {
    // Subtag bodies run behind a Send-bounded trait, so every accessor
    // future they await has to be Send too.
    fn require_send<T: Send>(value: T) -> T {
        value
    }

    let host = host(standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));

    let user = require_send(context.get_user("tester", LookupOptions::default()))
        .await
        .unwrap();
    assert_eq!(user.expect("user exists").id, "u1");
    require_send(context.get_role("nobody", LookupOptions::default()))
        .await
        .unwrap();
    let channel = require_send(context.get_channel("general", LookupOptions::default()))
        .await
        .unwrap();
    assert!(channel.is_some());
}

#[tokio::test]
async fn quiet_scope_suppresses_lookup_chatter() {
    let host = host(standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));
    context.modify_scope(|scope| scope.quiet = Some(true));

    let _ = context
        .get_user("nobody", LookupOptions::default())
        .await
        .unwrap();

    assert!(host.util.lookups.lock().unwrap()[0].quiet);
}

#[tokio::test]
async fn output_is_delivered_at_most_once() {
    let host = host(standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));

    let first = context.send_output("hello").await.unwrap();
    let second = context.send_output("ignored").await.unwrap();

    assert_eq!(first, second);
    assert!(first.is_some());
    assert_eq!(host.util.sent.lock().unwrap().len(), 1);
    assert_eq!(host.util.sent.lock().unwrap()[0].1.content, "hello");
    assert!(context.owns_message(&first.unwrap()));
}

#[tokio::test]
async fn empty_output_is_not_an_error() {
    let host = host(standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));

    let sent = context.send_output("").await.unwrap();

    assert_eq!(sent, None);
    assert!(host.util.sent.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sleep_is_capped_at_the_configured_maximum() {
    let config = EngineConfig {
        max_sleep: Duration::from_millis(50),
        ..Default::default()
    };
    let host = host_with_config(config, standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));

    let started = tokio::time::Instant::now();
    context.sleep(Duration::from_secs(3600)).await;

    assert_eq!(started.elapsed(), Duration::from_millis(50));
}

#[tokio::test]
async fn suspension_hands_a_capped_snapshot_to_the_scheduler() {
    let host = host(standard_registry());
    let context = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));
    context.set_variable("~scratch", Some("kept".to_string()));

    context.suspend(Duration::from_secs(3600)).await.unwrap();

    let scheduled = host.scheduler.scheduled.lock().unwrap();
    assert_eq!(scheduled.len(), 1);
    let (snapshot, delay) = &scheduled[0];
    assert_eq!(*delay, Duration::from_secs(300));
    assert_eq!(snapshot.tag_name, "testtag");
    assert_eq!(snapshot.temp_vars.get("~scratch"), Some(&"kept".to_string()));
}

#[tokio::test]
async fn suspension_without_a_scheduler_is_fatal() {
    let host = host(standard_registry());
    let engine = std::sync::Arc::new(bbtag::engine::BBTagEngine::new(
        EngineConfig::default(),
        host.util.clone(),
        host.store.clone(),
        std::sync::Arc::new(standard_registry()),
    ));
    let context = BBTagContext::new(engine, options(LimitKind::TagLimit));

    let error = context
        .suspend(Duration::from_secs(1))
        .await
        .err()
        .expect("no scheduler configured");
    assert!(matches!(error, Error::NoScheduler));
}

#[tokio::test]
async fn child_contexts_share_budgets_but_not_state() {
    let host = host(standard_registry());
    let parent = BBTagContext::new(host.engine.clone(), options(LimitKind::TagLimit));
    parent.set_variable("foo", Some("bar".to_string()));
    parent.add_error("parent failed", None, None);

    let child = parent.make_child(bbtag::context::ChildContextOptions {
        tag_name: Some("inner".to_string()),
        ..Default::default()
    });

    assert_eq!(child.tag_name, "inner");
    assert_eq!(child.root_tag_name, "testtag");
    assert!(child.errors().is_empty());
    // Shared variable cache: the child observes uncommitted parent writes.
    assert_eq!(
        child.get_variable("foo").await.unwrap(),
        Some("bar".to_string())
    );
    assert!(std::sync::Arc::ptr_eq(&parent.limit, &child.limit));
}
