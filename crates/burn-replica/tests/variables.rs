use burn_replica::{
    Aggregation, ComponentVariable, Delegate, DeviceSetBuilder, DistributedVariable, Item, LocalStrategy, Nest,
    Platform, Strategy, Synchronization, VariableOptions, checkpoint, make_distributed_variable,
    validate_colocate_distributed_variable,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::Arc;

fn strategy(n: usize) -> Arc<LocalStrategy<f32>> {
    LocalStrategy::new(DeviceSetBuilder::new().with_gpus(n).build().unwrap())
}

fn components(variable: &DistributedVariable<f32>) -> Vec<f32> {
    variable.values().iter().map(|c| c.read().unwrap()).collect()
}

#[rstest]
#[case::sum(Aggregation::Sum, 10.0)]
#[case::mean(Aggregation::Mean, 2.5)]
#[case::only_first_replica(Aggregation::OnlyFirstReplica, 1.0)]
fn test_mirrored_replica_updates_are_aggregated(#[case] aggregation: Aggregation, #[case] expected: f32) {
    let strategy = strategy(4);
    let variable = strategy
        .create_variable(VariableOptions::new().with_aggregation(aggregation), 0.0)
        .unwrap();

    strategy
        .run(|ctx| {
            let contribution = ctx.current_replica_id().unwrap() as f32 + 1.0;
            variable
                .assign_add(ctx, Item::value(contribution, None))
                .map(Nest::Leaf)
        })
        .unwrap();

    assert_eq!(components(&variable), vec![expected; 4]);
}

#[test]
fn test_mirrored_sum_of_ones() {
    let strategy = strategy(4);
    let variable = strategy
        .create_variable(VariableOptions::new().with_aggregation(Aggregation::Sum), 0.0)
        .unwrap();

    strategy
        .run(|ctx| variable.assign_add(ctx, Item::value(1.0, None)).map(Nest::Leaf))
        .unwrap();

    assert_eq!(variable.read_value(&strategy.scope()).unwrap().evaluate(), 4.0);
}

#[test]
fn test_run_regroups_components_into_their_variable() {
    let strategy = strategy(3);
    let variable = strategy.create_variable(VariableOptions::new(), 1.0).unwrap();

    let result = strategy.run(|ctx| variable.get(ctx).map(Nest::Leaf)).unwrap();
    assert!(result.as_leaf().unwrap().same_as(&Item::Variable(variable.clone())));
}

#[test]
fn test_replica_reads_own_component() {
    let strategy = strategy(2);
    let variable = strategy
        .create_variable(
            VariableOptions::new()
                .with_synchronization(Synchronization::OnRead)
                .with_aggregation(Aggregation::Sum),
            0.0,
        )
        .unwrap();

    strategy
        .run(|ctx| {
            let id = ctx.current_replica_id().unwrap() as f32;
            variable.assign(ctx, Item::value(id * 5.0, None))?;
            assert_eq!(variable.mul(ctx, 2.0)?, id * 10.0);
            Ok(Nest::Tuple(Vec::new()))
        })
        .unwrap();
}

#[test]
fn test_sync_on_read_sum_survives_checkpoint() {
    let strategy = strategy(3);
    let variable = strategy
        .create_variable(
            VariableOptions::new()
                .with_name("examples_seen")
                .with_synchronization(Synchronization::OnRead)
                .with_aggregation(Aggregation::Sum),
            0.0,
        )
        .unwrap();

    strategy
        .run(|ctx| variable.assign(ctx, Item::value(2.0, None)).map(Nest::Leaf))
        .unwrap();
    assert_eq!(variable.read_value(&strategy.scope()).unwrap().evaluate(), 6.0);

    let entries = checkpoint::save_entries::<f32>(&[&variable]).unwrap();
    variable.values()[2].assign(40.0).unwrap();
    checkpoint::restore_entries::<f32>(&[&variable], &entries)
        .unwrap()
        .run();

    assert_eq!(components(&variable), vec![2.0, 2.0, 2.0]);
}

#[test]
#[should_panic = "SyncOnReadVariable does not support assign_add in cross-replica context when aggregation is SUM"]
fn test_sync_on_read_sum_rejects_cross_replica_add() {
    let strategy = strategy(2);
    let variable = strategy
        .create_variable(
            VariableOptions::new()
                .with_synchronization(Synchronization::OnRead)
                .with_aggregation(Aggregation::Sum),
            0.0,
        )
        .unwrap();

    let _value = variable.assign_add(&strategy.scope(), Item::value(1.0, None)).unwrap();
}

#[test]
#[should_panic = "colocate_vars_with must only be passed a variable created in the scope of"]
fn test_colocation_across_strategies() {
    let first = strategy(2);
    let second = strategy(2);
    let variable = first.create_variable(VariableOptions::new(), 0.0).unwrap();

    validate_colocate_distributed_variable(&Item::Variable(variable.clone()), first.as_ref()).unwrap();
    validate_colocate_distributed_variable(&Item::Variable(variable), second.as_ref()).unwrap();
}

#[test]
fn test_accelerator_variable_outside_accelerator_context() {
    let strategy = strategy(2);
    let variable = strategy
        .create_variable(
            VariableOptions::new()
                .with_platform(Platform::Accelerator)
                .with_aggregation(Aggregation::Mean),
            1.0,
        )
        .unwrap();

    strategy
        .run(|ctx| variable.assign(ctx, Item::value(4.0, None)).map(Nest::Leaf))
        .unwrap();

    assert_eq!(components(&variable), vec![4.0, 4.0]);
    assert_eq!(format!("{variable:?}").lines().next(), Some("AcceleratorMirroredVariable:{"));
}

#[test]
fn test_options_round_trip_through_json() {
    let options = VariableOptions::new()
        .with_name("accuracy/count")
        .with_synchronization(Synchronization::OnRead)
        .with_aggregation(Aggregation::OnlyFirstReplica)
        .with_trainable(false);

    let json = serde_json::to_string(&options).unwrap();
    assert!(json.contains("\"ONLY_FIRST_REPLICA\""));
    assert!(json.contains("\"ON_READ\""));

    let decoded: VariableOptions = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, options);
}

#[test]
fn test_options_defaults_from_json() {
    let decoded: VariableOptions = serde_json::from_str(r#"{"aggregation": "SUM"}"#).unwrap();

    assert_eq!(decoded.aggregation, Aggregation::Sum);
    assert_eq!(decoded.synchronization, Synchronization::Auto);
    assert_eq!(decoded.platform, Platform::Host);
    assert_eq!(decoded.name, None);
}

#[test]
fn test_options_reject_unknown_fields() {
    let decoded = serde_json::from_str::<VariableOptions>(r#"{"aggregation": "SUM", "colocate": true}"#);
    assert!(decoded.is_err());
}

#[test]
fn test_deferred_components_report_uninitialized() {
    let strategy = strategy(3);
    let shared: Arc<dyn Strategy<f32>> = strategy.clone();
    let variable = make_distributed_variable(
        &shared,
        |devices, _| {
            Ok(devices
                .iter()
                .enumerate()
                .map(|(i, device)| ComponentVariable::deferred(format!("step/replica_{i}:0"), device.clone(), 0.0, false))
                .collect())
        },
        VariableOptions::new().with_name("step"),
    )
    .unwrap();

    let initialized = variable.is_initialized(Some("step/is_initialized"));
    assert!(!initialized.evaluate());

    variable.values()[0].initializer().run();
    assert!(!variable.is_initialized(None).evaluate());

    variable.initializer().run();
    assert!(variable.is_initialized(None).evaluate());
}

#[test]
#[should_panic = "Variable weights belongs to LocalStrategy#"]
fn test_mutating_under_a_foreign_scope() {
    let owner = strategy(2);
    let other = strategy(2);
    let variable = owner
        .create_variable(VariableOptions::new().with_name("weights"), 1.0)
        .unwrap();

    let _read = variable.assign(&other.scope(), Item::value(2.0, None)).unwrap();
}
