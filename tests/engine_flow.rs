mod common;

use std::sync::Arc;
use std::time::Duration;

use adaptive_bypass::{
    ExecutionMethod, OutcomeLog, OutcomeReport, SelectionMethod, SelectionOutcome, StrategyEngine,
    StrategyOrigin, StrategyParams, Tactic, TacticStatus,
};
use common::{ScriptedExecutor, builder, context};

fn viewport_only(params: &StrategyParams) -> bool {
    matches!(
        params,
        StrategyParams::BrowserRender(render)
            if render.viewport.is_some() && render.geolocation.is_none()
    )
}

#[tokio::test]
async fn viewport_only_target_registers_one_discovered_strategy() {
    let executor = Arc::new(ScriptedExecutor::new(viewport_only));
    let engine = builder(executor.clone()).build().unwrap();

    let outcome = engine.select_strategy(&context("perimeterx")).await;
    let selection = outcome.into_selection().expect("discovery should find a strategy");
    assert_eq!(selection.discovered_by, Some(Tactic::ViewportVariation));
    assert_eq!(selection.strategy.name, "viewport_variation_1920x1080");
    assert_eq!(
        selection.strategy.origin,
        StrategyOrigin::Discovered {
            tactic: "viewport_variation".into()
        }
    );
    assert!(selection.strategy.id.as_str().starts_with("viewport_variation-"));

    let stored = engine.store().list_strategies(&"perimeterx".into()).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, selection.strategy.id);

    // Four user agents, eight direct header variants, then the first viewport.
    let calls = executor.calls();
    assert_eq!(calls.len(), 13);
    assert!(calls.iter().all(|params| params.method() != ExecutionMethod::Interactive));
    assert!(!calls.iter().any(|params| matches!(
        params,
        StrategyParams::BrowserRender(render) if render.geolocation.is_some()
    )));
}

#[tokio::test]
async fn discovery_runs_exactly_once_per_selection() {
    let executor = Arc::new(ScriptedExecutor::never());
    let engine = builder(executor.clone()).build().unwrap();

    let first = engine.select_strategy(&context("kasada")).await;
    let per_call = executor.call_count();
    match first {
        SelectionOutcome::Unresolved {
            attempts, aborted, ..
        } => {
            assert!(!aborted);
            assert_eq!(attempts.len(), Tactic::ORDERED.len());
            assert!(attempts.iter().all(|attempt| attempt.status == TacticStatus::Exhausted));
            assert_eq!(attempts.iter().map(|attempt| attempt.probes).sum::<usize>(), per_call);
        }
        SelectionOutcome::Selected(selection) => {
            panic!("unexpected selection {:?}", selection.strategy)
        }
    }

    assert!(!engine.select_strategy(&context("kasada")).await.is_selected());
    assert_eq!(executor.call_count(), per_call * 2);
    assert!(engine.store().list_strategies(&"kasada".into()).unwrap().is_empty());
}

#[tokio::test]
async fn discovered_strategy_is_reused_without_new_probes() {
    let executor = Arc::new(ScriptedExecutor::always());
    let engine = builder(executor.clone()).build().unwrap();

    let first = engine.select_strategy(&context("shape")).await.into_selection().unwrap();
    assert_eq!(first.discovered_by, Some(Tactic::UserAgentRotation));
    assert_eq!(executor.call_count(), 1);

    let second = engine.select_strategy(&context("shape")).await.into_selection().unwrap();
    assert_eq!(second.strategy.id, first.strategy.id);
    assert!(second.discovered_by.is_none());
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn known_protection_types_never_discover() {
    let executor = Arc::new(ScriptedExecutor::never());
    let engine = builder(executor.clone()).build().unwrap();

    for protection_type in ["cloudflare", "ddos_guard", "captcha", "recaptcha", "ip_block"] {
        let outcome = engine.select_strategy(&context(protection_type)).await;
        assert!(outcome.is_selected(), "{} should resolve from rules", protection_type);
    }
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn disabled_discovery_falls_back_to_generic_defaults() {
    let executor = Arc::new(ScriptedExecutor::never());
    let engine = builder(executor.clone()).disable_discovery().build().unwrap();

    let selection = engine.select_strategy(&context("imperva")).await.into_selection().unwrap();
    assert_eq!(selection.strategy.name, "browser_render");
    assert_eq!(selection.strategy.id.as_str(), "imperva/browser_render");
    assert_eq!(selection.strategy.origin, StrategyOrigin::Bootstrap);
    assert_eq!(engine.store().list_strategies(&"imperva".into()).unwrap().len(), 2);
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn passed_deadline_aborts_discovery() {
    let executor = Arc::new(ScriptedExecutor::always());
    let engine = builder(executor.clone()).build().unwrap();
    let deadline = tokio::time::Instant::now() - Duration::from_millis(1);

    match engine.select_strategy_until(&context("datadome"), deadline).await {
        SelectionOutcome::Unresolved { aborted, attempts, .. } => {
            assert!(aborted);
            assert!(attempts.is_empty());
        }
        SelectionOutcome::Selected(_) => panic!("deadline should stop discovery"),
    }
    assert_eq!(executor.call_count(), 0);
    assert!(engine.store().list_strategies(&"datadome".into()).unwrap().is_empty());
}

#[tokio::test]
async fn reported_outcomes_steer_the_rule_path() {
    let engine = builder(Arc::new(ScriptedExecutor::never())).build().unwrap();
    let cloudflare = context("cloudflare");

    let first = engine.select_strategy(&cloudflare).await.into_selection().unwrap();
    assert_eq!(first.strategy.name, "browser_render");
    engine
        .report_outcome(OutcomeReport::from_selection(&first, false, Duration::from_secs(4)))
        .unwrap();

    // The failed default is skipped for the next untried one.
    let second = engine.select_strategy(&cloudflare).await.into_selection().unwrap();
    assert_eq!(second.strategy.name, "browser_interactive");
    engine
        .report_outcome(OutcomeReport::from_selection(&second, true, Duration::from_secs(2)))
        .unwrap();

    // Once something succeeded the ranked leader wins.
    for _ in 0..3 {
        let next = engine.select_strategy(&cloudflare).await.into_selection().unwrap();
        assert_eq!(next.strategy.name, "browser_interactive");
        assert_eq!(next.method, SelectionMethod::RuleBased);
    }

    let stats = engine.store().get_stats(&second.strategy.id).unwrap().unwrap();
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.avg_duration(), Some(Duration::from_secs(2)));
    let failed = engine.store().get_stats(&first.strategy.id).unwrap().unwrap();
    assert_eq!(failed.fail_count, 1);
    assert_eq!(failed.avg_duration(), None);
}

#[tokio::test]
async fn apply_selection_treats_a_block_page_as_failure() {
    let engine = builder(Arc::new(ScriptedExecutor::never())).build().unwrap();
    let selection = engine.select_strategy(&context("cloudflare")).await.into_selection().unwrap();

    let applied = engine.apply_selection(&selection, Duration::from_secs(1)).await.unwrap();
    let report = applied.report.unwrap();
    assert_eq!(report.status, 403);
    assert_eq!(applied.features.title_keywords, vec!["just a moment".to_string()]);

    let record = applied.ack.record.unwrap();
    assert!(!record.success);
    assert_eq!(record.sequence, 0);
    assert_eq!(record.strategy_name, "browser_render");
    assert_eq!(applied.ack.stats.unwrap().fail_count, 1);
}

#[tokio::test]
async fn concurrent_reports_are_all_counted() {
    let engine = Arc::new(builder(Arc::new(ScriptedExecutor::never())).build().unwrap());
    let selection = engine.select_strategy(&context("ddos_guard")).await.into_selection().unwrap();

    let mut handles = Vec::new();
    for i in 0..40u64 {
        let engine = Arc::clone(&engine);
        let selection = selection.clone();
        handles.push(tokio::spawn(async move {
            let success = i % 4 != 0;
            engine
                .report_outcome(OutcomeReport::from_selection(
                    &selection,
                    success,
                    Duration::from_millis(100 + i),
                ))
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = engine.store().get_stats(&selection.strategy.id).unwrap().unwrap();
    assert_eq!(stats.success_count, 30);
    assert_eq!(stats.fail_count, 10);
    assert_eq!(engine.outcome_log().len().unwrap(), 40);

    let sequences: Vec<u64> = engine
        .outcome_log()
        .read_all()
        .unwrap()
        .iter()
        .map(|record| record.sequence)
        .collect();
    assert_eq!(sequences, (0..40).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reports_with_background_training_retrain_per_threshold() {
    let engine = Arc::new(
        StrategyEngine::builder()
            .with_executor(Arc::new(ScriptedExecutor::never()))
            .with_seed(7)
            .with_ml_weight(0.0)
            .with_update_threshold(5)
            .build()
            .unwrap(),
    );
    let selection = engine.select_strategy(&context("cloudflare")).await.into_selection().unwrap();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let engine = Arc::clone(&engine);
        let selection = selection.clone();
        handles.push(tokio::spawn(async move {
            engine
                .report_outcome(OutcomeReport::from_selection(
                    &selection,
                    true,
                    Duration::from_millis(80),
                ))
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let trainer = engine.trainer();
    let mut polls = 0;
    while trainer.is_running() || trainer.pending_records().unwrap() >= 5 {
        polls += 1;
        assert!(polls < 500, "background retrain did not settle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let meta = trainer.meta().unwrap();
    assert!(meta.update_count >= 1);
    assert!(meta.total_records >= 5 * meta.update_count);
    assert_eq!(engine.checkpoint_version(), Some(meta.update_count));
}

#[test]
fn default_engine_builds_without_a_runtime() {
    let engine = StrategyEngine::new().unwrap();
    assert!(engine.checkpoint_version().is_none());
    assert!(engine.statistics().unwrap().is_empty());
}
