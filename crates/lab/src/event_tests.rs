// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::{SkipDecision, SkipResult, SkipSignal};
use crate::job::TestResult;

#[test]
fn aggregate_of_nothing_is_none() {
    assert!(SkipDecision::aggregate([]).is_none());
}

#[test]
fn single_signal_passes_through() -> anyhow::Result<()> {
    let decision = SkipDecision::aggregate([SkipSignal::new(SkipResult::Pass, "no-op")])
        .ok_or_else(|| anyhow::anyhow!("expected a decision"))?;
    assert_eq!(decision.result, SkipResult::Pass);
    assert_eq!(decision.reason(), "no-op");
    Ok(())
}

#[test]
fn worst_result_wins_and_reasons_accumulate() -> anyhow::Result<()> {
    let decision = SkipDecision::aggregate([
        SkipSignal::new(SkipResult::Pass, "plugin a"),
        SkipSignal::new(SkipResult::Error, "plugin b"),
        SkipSignal::new(SkipResult::Skip, "plugin c"),
    ])
    .ok_or_else(|| anyhow::anyhow!("expected a decision"))?;
    assert_eq!(decision.result, SkipResult::Error);
    assert_eq!(decision.reason(), "plugin a; plugin b; plugin c");
    Ok(())
}

#[yare::parameterized(
    pass = { SkipResult::Pass, TestResult::Pass },
    skip = { SkipResult::Skip, TestResult::Pass },
    error = { SkipResult::Error, TestResult::Error },
)]
fn skip_results_map_to_test_results(skip: SkipResult, expected: TestResult) {
    assert_eq!(skip.to_test_result(), expected);
}
