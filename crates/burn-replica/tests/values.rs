use burn_replica::{
    ContainerRegistry, Context, Delegate, Device, DeviceSetBuilder, Item, LocalStrategy, Mirrored, Nest, Output,
    PerReplica, Strategy, VariableOptions, regroup, select_replica, select_replica_mirrored, update_regroup,
    value_container,
};
use rstest::rstest;
use std::collections::BTreeMap;
use std::sync::Arc;

fn strategy(n: usize) -> Arc<LocalStrategy<f32>> {
    LocalStrategy::new(DeviceSetBuilder::new().with_gpus(n).build().unwrap())
}

fn step_output(loss: f32, replica: usize) -> Nest<Item<f32>> {
    let mut metrics = BTreeMap::new();
    metrics.insert("loss".to_string(), Nest::Leaf(Item::value(loss, Some(Device::gpu(replica)))));
    Nest::Record {
        name: "StepOutput".into(),
        fields: vec![
            ("metrics".into(), Nest::Map(metrics)),
            (
                "grads".into(),
                Nest::Seq(vec![
                    Nest::Leaf(Item::value(loss * 10.0, None)),
                    Nest::Leaf(Item::value(loss * 100.0, None)),
                ]),
            ),
        ],
    }
}

fn leaf_values(nest: &Nest<Item<f32>>) -> Vec<f32> {
    let ctx = Context::<f32>::cross_replica();
    nest.flatten()
        .into_iter()
        .map(|item| item.evaluate(&ctx).unwrap())
        .collect()
}

#[rstest]
#[case::single(1)]
#[case::pair(2)]
#[case::four(4)]
fn test_get_selects_each_replica(#[case] replicas: usize) {
    let strategy = strategy(replicas);
    let values = PerReplica::new((0..replicas).map(|i| Item::value(i as f32, None)).collect()).unwrap();

    let seen = strategy
        .run(|ctx| {
            let own = values.operand(ctx)?;
            assert_eq!(own, ctx.current_replica_id().unwrap() as f32);
            Ok(Nest::Leaf(Item::value(own, None)))
        })
        .unwrap();

    for replica in 0..replicas {
        let selected = select_replica(replica, &seen).unwrap();
        assert_eq!(leaf_values(&selected), vec![replica as f32]);
    }
}

#[test]
fn test_mirrored_reads_in_cross_replica_context() {
    let values = Mirrored::new(vec![
        Item::value(3.0, Some(Device::gpu(0))),
        Item::value(3.0, Some(Device::gpu(1))),
    ])
    .unwrap();

    assert_eq!(values.operand(&Context::<f32>::cross_replica()).unwrap(), 3.0);
    let on_second = Context::<f32>::cross_replica().on_device(Device::gpu(1));
    assert!(values.select(&on_second).unwrap().same_as(&values.values()[1]));
}

#[test]
fn test_regroup_then_select_restores_each_replica() {
    let registry = ContainerRegistry::<f32>::default();
    let outputs: Vec<_> = (0..3).map(|i| step_output(i as f32 + 1.0, i)).collect();
    let expected: Vec<_> = outputs.iter().map(leaf_values).collect();

    let regrouped = regroup(outputs, &registry).unwrap();
    for (replica, expected) in expected.iter().enumerate() {
        let selected = select_replica(replica, &regrouped).unwrap();
        assert_eq!(&leaf_values(&selected), expected);
    }
}

#[test]
#[should_panic = "Expected value to be mirrored across replicas"]
fn test_select_mirrored_rejects_per_replica() {
    let registry = ContainerRegistry::<f32>::default();
    let regrouped = regroup(vec![step_output(1.0, 0), step_output(2.0, 1)], &registry).unwrap();

    let _selected = select_replica_mirrored(0, &regrouped).unwrap();
}

#[test]
#[should_panic = "StructuralMismatch"]
fn test_regroup_rejects_different_records() {
    let registry = ContainerRegistry::<f32>::default();
    let other = Nest::Record {
        name: "Other".into(),
        fields: Vec::new(),
    };

    let _regrouped = regroup(vec![step_output(1.0, 0), other], &registry).unwrap();
}

#[test]
fn test_grouped_update_waits_for_every_replica() {
    let registry = ContainerRegistry::<f32>::default();
    let (first, first_done) = Output::pending(Some(Device::gpu(0)));
    let (second, second_done) = Output::pending(Some(Device::gpu(1)));
    let updates = vec![Nest::Leaf(Item::Value(first)), Nest::Leaf(Item::Value(second.clone()))];

    let regrouped = update_regroup(updates, true, &registry).unwrap();
    let Some(Item::Mirrored(mirrored)) = regrouped.as_leaf() else {
        panic!("Expected a mirrored update");
    };
    let observed = mirrored.values()[0].as_output().unwrap().clone();

    let writer = std::thread::spawn(move || {
        first_done.fulfill(1.0);
        std::thread::sleep(std::time::Duration::from_millis(20));
        second_done.fulfill(2.0);
    });

    assert_eq!(observed.evaluate(), 1.0);
    assert!(second.is_ready());
    writer.join().unwrap();
}

#[test]
#[should_panic = "Flattening a PerReplica to components is not supported in replica context"]
fn test_per_replica_components_need_cross_replica_context() {
    let strategy = strategy(2);
    let losses = PerReplica::new(vec![Item::value(1.0, None), Item::value(2.0, None)]).unwrap();

    strategy
        .run(|ctx| {
            let components = losses.to_components(ctx)?;
            Ok(Nest::Seq(components.into_iter().map(Nest::Leaf).collect()))
        })
        .unwrap();
}

#[test]
fn test_value_container_follows_the_live_owner() {
    let strategy = strategy(2);
    let variable = strategy.create_variable(VariableOptions::new(), 1.0).unwrap();
    let component = Item::Component(variable.values()[1].clone());

    let container = value_container(&component, strategy.registry());
    assert!(container.same_as(&Item::Variable(variable.clone())));

    let plain = Item::value(1.0, None);
    assert!(value_container(&plain, strategy.registry()).same_as(&plain));

    drop(container);
    drop(variable);
    assert!(value_container(&component, strategy.registry()).same_as(&component));
}
