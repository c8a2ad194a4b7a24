//! Property tests over arbitrary operation sequences on one branch.

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

use oracle_sentinel::domain::HealthyReading;
use oracle_sentinel::{
    BranchId, DependentGate, GatePolicy, OperationKind, PriceCache, RecoveryAuthorization,
    ShutdownCause, ShutdownKind, ShutdownRegistry,
};

#[derive(Debug, Clone)]
enum Op {
    OracleFailed,
    Governance,
    Halt,
    Recover,
    RecoverWithoutOperator,
    Healthy(u32),
    Check(OperationKind),
}

fn arb_kind() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::StateChanging),
        Just(OperationKind::Read),
        Just(OperationKind::Unwind),
        Just(OperationKind::Unclassified),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::OracleFailed),
        1 => Just(Op::Governance),
        1 => Just(Op::Halt),
        3 => Just(Op::Recover),
        1 => Just(Op::RecoverWithoutOperator),
        3 => (1..1_000_000u32).prop_map(Op::Healthy),
        3 => arb_kind().prop_map(Op::Check),
    ]
}

/// Expected kind after applying `op` to `kind`
fn model(kind: ShutdownKind, op: &Op) -> ShutdownKind {
    match (kind, op) {
        (ShutdownKind::Permanent, _) => ShutdownKind::Permanent,
        (_, Op::Halt) => ShutdownKind::Permanent,
        (_, Op::OracleFailed | Op::Governance) => ShutdownKind::Temporary,
        (ShutdownKind::Temporary, Op::Recover) => ShutdownKind::Active,
        (kind, _) => kind,
    }
}

fn run(ops: &[Op]) -> Result<(), TestCaseError> {
    tokio_test::block_on(async {
        let branch = BranchId::new("eth-usd");
        let registry = Arc::new(ShutdownRegistry::in_memory([branch.clone()]));
        let cache = PriceCache::new([branch.clone()]);
        let gate = DependentGate::new(
            registry.clone(),
            [(branch.clone(), GatePolicy::reads_and_unwind())]
                .into_iter()
                .collect(),
        );

        let mut expected = ShutdownKind::Active;
        let mut reached_permanent = false;

        for op in ops {
            match op {
                Op::OracleFailed => {
                    let _ = registry
                        .trigger_temporary(&branch, ShutdownCause::OracleFailure)
                        .await;
                }
                Op::Governance => {
                    let _ = registry
                        .trigger_temporary(&branch, ShutdownCause::Governance("vote".to_string()))
                        .await;
                }
                Op::Halt => {
                    registry
                        .trigger_permanent(&branch, ShutdownCause::External("audit".to_string()))
                        .await
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                }
                Op::Recover => {
                    let auth = RecoveryAuthorization::new(branch.clone(), "ops");
                    let result = registry.recover(&branch, &auth).await;
                    prop_assert_eq!(result.is_ok(), expected == ShutdownKind::Temporary);
                }
                Op::RecoverWithoutOperator => {
                    let auth = RecoveryAuthorization::new(branch.clone(), "");
                    prop_assert!(registry.recover(&branch, &auth).await.is_err());
                }
                Op::Healthy(cents) => {
                    let reading = HealthyReading {
                        value: Decimal::new(i64::from(*cents), 2),
                        observed_at: Utc::now(),
                    };
                    cache.record(&branch, &reading).await;
                }
                Op::Check(kind) => {
                    let decision = gate.check(&branch, *kind).await;
                    if !kind.is_allowlistable() {
                        prop_assert_eq!(decision.is_allowed(), expected == ShutdownKind::Active);
                    }
                    if expected == ShutdownKind::Active {
                        prop_assert!(decision.is_allowed());
                    }
                }
            }

            if !matches!(op, Op::RecoverWithoutOperator) {
                expected = model(expected, op);
            }
            let actual = registry.current_state(&branch).await.unwrap().kind();
            prop_assert_eq!(actual, expected, "after {:?}", op);

            reached_permanent |= actual == ShutdownKind::Permanent;
            if reached_permanent {
                prop_assert_eq!(actual, ShutdownKind::Permanent);
            }
        }
        Ok::<(), TestCaseError>(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_registry_follows_transition_model(ops in prop::collection::vec(arb_op(), 0..40)) {
        run(&ops)?;
    }

    #[test]
    fn prop_permanent_is_absorbing(
        prefix in prop::collection::vec(arb_op(), 0..10),
        suffix in prop::collection::vec(arb_op(), 0..30),
    ) {
        let mut ops = prefix;
        ops.push(Op::Halt);
        ops.extend(suffix);
        run(&ops)?;
    }
}
