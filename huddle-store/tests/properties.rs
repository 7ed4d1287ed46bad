//! Randomized properties of the storage document.
//!
//! Seeded generators keep these deterministic across runs:
//! - applying recorded inverse batches in reverse order restores the
//!   initial state
//! - two documents fed the same op stream in the same total order end up
//!   bit-identical

use huddle_store::{
    IdFactory, NodeId, Op, OpSource, Payload, StorageDoc,
};
use huddle_store::position;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

/// Pick a random valid mutation against the current tree.
fn random_op(doc: &StorageDoc, ids: &mut IdFactory, rng: &mut StdRng) -> Op {
    let mut objects = Vec::new();
    let mut maps = Vec::new();
    let mut lists = Vec::new();
    let mut deletable = Vec::new();
    for id in doc.node_ids() {
        let node = doc.node(id).expect("listed node");
        match &node.payload {
            Payload::Object { .. } => objects.push(id),
            Payload::Map { .. } => maps.push(id),
            Payload::List { .. } => lists.push(id),
            Payload::Register { .. } => {}
        }
        if !id.is_root() {
            deletable.push(id);
        }
    }
    objects.sort();
    maps.sort();
    lists.sort();
    deletable.sort();

    loop {
        match rng.gen_range(0..6) {
            // set a plain field on a random object
            0 | 1 => {
                let target = objects[rng.gen_range(0..objects.len())];
                let key = format!("k{}", rng.gen_range(0..6));
                let mut data = serde_json::Map::new();
                data.insert(key, json!(rng.gen_range(0..100)));
                return Op::UpdateObject {
                    op_id: ids.op_id(),
                    id: target,
                    data,
                    deleted: Vec::new(),
                };
            }
            // create a container under a random object
            2 => {
                let parent = objects[rng.gen_range(0..objects.len())];
                let key = format!("c{}", rng.gen_range(0..4));
                let id = ids.node_id();
                return if rng.gen_bool(0.5) {
                    Op::CreateMap {
                        op_id: ids.op_id(),
                        id,
                        parent_id: parent,
                        parent_key: key,
                    }
                } else {
                    Op::CreateList {
                        op_id: ids.op_id(),
                        id,
                        parent_id: parent,
                        parent_key: key,
                    }
                };
            }
            // put a register into a random map
            3 if !maps.is_empty() => {
                let parent = maps[rng.gen_range(0..maps.len())];
                let key = format!("m{}", rng.gen_range(0..4));
                // the live handles delete an occupant before re-creating;
                // the raw generator only fills empty slots
                let Payload::Map { entries } = &doc.node(parent).expect("map").payload else {
                    unreachable!();
                };
                if entries.contains_key(&key) {
                    continue;
                }
                return Op::CreateRegister {
                    op_id: ids.op_id(),
                    id: ids.node_id(),
                    parent_id: parent,
                    parent_key: key,
                    data: json!(format!("v{}", rng.gen_range(0..100))),
                };
            }
            // append into a random list
            4 if !lists.is_empty() => {
                let parent = lists[rng.gen_range(0..lists.len())];
                let Payload::List { children } = &doc.node(parent).expect("list").payload else {
                    unreachable!();
                };
                let pos = match children.keys().next_back() {
                    None => position::first(),
                    Some(last) => position::after(&last.position),
                };
                return Op::CreateRegister {
                    op_id: ids.op_id(),
                    id: ids.node_id(),
                    parent_id: parent,
                    parent_key: pos,
                    data: json!(rng.gen_range(0..100)),
                };
            }
            // delete a random non-root node
            5 if !deletable.is_empty() => {
                let target = deletable[rng.gen_range(0..deletable.len())];
                return Op::DeleteCrdt {
                    op_id: ids.op_id(),
                    id: target,
                };
            }
            _ => continue,
        }
    }
}

#[test]
fn inverse_batches_restore_initial_state() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(1);

        // warm up some structure that is part of the "initial" state
        for _ in 0..10 {
            let op = random_op(&doc, &mut ids, &mut rng);
            doc.apply(&op, OpSource::Local, &mut ids)
                .expect("warmup op applies");
        }
        let initial = doc.serialize_items();

        // record inverse batches, newest first
        let mut inverse_batches = Vec::new();
        for _ in 0..30 {
            let op = random_op(&doc, &mut ids, &mut rng);
            let applied = doc
                .apply(&op, OpSource::Local, &mut ids)
                .expect("recorded op applies");
            inverse_batches.push(applied.inverse);
        }

        for batch in inverse_batches.into_iter().rev() {
            for inv in batch {
                doc.apply(&inv, OpSource::Local, &mut ids)
                    .expect("inverse applies");
            }
        }
        assert_eq!(
            doc.serialize_items(),
            initial,
            "seed {seed}: inverses did not restore the initial tree"
        );
    }
}

#[test]
fn same_total_order_converges_bit_identically() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(1000 + seed);
        let mut source = StorageDoc::new();
        let mut ids = IdFactory::new(1);

        let mut stream = Vec::new();
        for _ in 0..40 {
            let op = random_op(&source, &mut ids, &mut rng);
            source
                .apply(&op, OpSource::Local, &mut ids)
                .expect("source op applies");
            stream.push(op);
        }

        // a second replica applies the identical stream as remote ops
        let mut replica = StorageDoc::new();
        let mut replica_ids = IdFactory::new(2);
        for op in &stream {
            replica
                .apply(op, OpSource::Remote, &mut replica_ids)
                .expect("replica op applies");
        }

        assert_eq!(
            replica.serialize_items(),
            source.serialize_items(),
            "seed {seed}: replicas diverged"
        );
        let items = source.serialize_items();
        let text_a = serde_json::to_string(&items).expect("serializes");
        let text_b =
            serde_json::to_string(&replica.serialize_items()).expect("serializes");
        assert_eq!(text_a, text_b);
    }
}

#[test]
fn delete_then_inverse_preserves_node_ids() {
    let mut doc = StorageDoc::new();
    let mut ids = IdFactory::new(1);

    let list_id = ids.node_id();
    doc.apply(
        &Op::CreateList {
            op_id: ids.op_id(),
            id: list_id,
            parent_id: NodeId::ROOT,
            parent_key: "l".into(),
        },
        OpSource::Local,
        &mut ids,
    )
    .expect("create list");
    let reg_id = ids.node_id();
    doc.apply(
        &Op::CreateRegister {
            op_id: ids.op_id(),
            id: reg_id,
            parent_id: list_id,
            parent_key: position::first(),
            data: json!("x"),
        },
        OpSource::Local,
        &mut ids,
    )
    .expect("create register");

    let applied = doc
        .apply(
            &Op::DeleteCrdt {
                op_id: ids.op_id(),
                id: list_id,
            },
            OpSource::Local,
            &mut ids,
        )
        .expect("delete list");
    for inv in &applied.inverse {
        doc.apply(inv, OpSource::Local, &mut ids).expect("inverse");
    }
    assert!(doc.contains(list_id));
    assert!(doc.contains(reg_id));
}
