use std::io::Write;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use graph_memplan::{
    memory::registry::Registry,
    model::attr,
    Attribute, BufferKind, DataType, Error, ExecArg, MemoryDesc, MemoryPlanner, OpKind,
    PlannerOptions, Subgraph, SubgraphBuilder, ValueId,
};

fn planner() -> MemoryPlanner {
    MemoryPlanner::new(PlannerOptions::default()).expect("default options are valid")
}

/// x -> a -> b -> c -> y through element-wise ops, every value `bytes` wide
fn chain(bytes: usize) -> (Subgraph, Vec<ValueId>) {
    let mut builder = SubgraphBuilder::new();
    let ids: Vec<ValueId> = ["x", "a", "b", "c", "y"]
        .iter()
        .map(|name| builder.add_value(name, MemoryDesc::bytes(bytes)))
        .collect();
    for (i, pair) in ids.windows(2).enumerate() {
        builder.add_op(OpKind::Eltwise, &format!("relu{}", i), &[pair[0]], &[pair[1]]);
    }
    builder.mark_input(ids[0]);
    builder.mark_output(ids[4]);
    (builder.build().expect("chain is well formed"), ids)
}

#[test]
fn test_disjoint_liveness_reuses_one_buffer() -> Result<()> {
    // A (100), B (50), C (100), each fully consumed before the next is produced
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::bytes(100));
    let a = builder.add_value("A", MemoryDesc::bytes(100));
    let b = builder.add_value("B", MemoryDesc::bytes(50));
    let c = builder.add_value("C", MemoryDesc::bytes(100));
    let outs: Vec<ValueId> = (0..3)
        .map(|i| builder.add_value(&format!("out{}", i), MemoryDesc::bytes(100)))
        .collect();

    for (i, (&tmp, &out)) in [a, b, c].iter().zip(&outs).enumerate() {
        builder.add_op(OpKind::Eltwise, &format!("produce{}", i), &[x], &[tmp]);
        builder.add_op(OpKind::Pooling, &format!("consume{}", i), &[tmp], &[out]);
        builder.mark_output(out);
    }
    builder.mark_input(x);
    let graph = builder.build()?;

    let mut planner = planner();
    planner.run(&graph)?;

    assert_eq!(planner.total_internal_temporary_size(), 100);
    assert_eq!(planner.memory_info(a), "temporary_0");
    assert_eq!(planner.memory_info(b), "temporary_0");
    assert_eq!(planner.memory_info(c), "temporary_0");

    let summary = planner.summary(&graph);
    assert_eq!(summary.naive_temporary_bytes, 250);
    assert_eq!(summary.planned_temporary_bytes, 100);
    assert_eq!(summary.temporary_buffers, 1);
    Ok(())
}

#[test]
fn test_disabled_sharing_matches_naive_sum() -> Result<()> {
    let (graph, ids) = chain(100);
    let options = PlannerOptions::new().enable_memory_sharing(false);
    let mut planner = MemoryPlanner::new(options)?;
    planner.run(&graph)?;

    let summary = planner.summary(&graph);
    assert!(!summary.memory_sharing);
    assert_eq!(summary.temporary_buffers, 3);
    assert_eq!(summary.planned_temporary_bytes, summary.naive_temporary_bytes);
    assert_eq!(summary.planned_temporary_bytes, 300);
    assert_ne!(planner.memory_info(ids[1]), planner.memory_info(ids[3]));
    // 100 + pad to 128, twice, then the last 100
    assert_eq!(planner.total_internal_temporary_size(), 356);
    Ok(())
}

#[test]
fn test_in_place_chain_shares_assignment() -> Result<()> {
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::new(vec![4, 8], DataType::F32));
    let w = builder.add_value("w", MemoryDesc::new(vec![8, 8], DataType::F32));
    let t = builder.add_value("t", MemoryDesc::new(vec![4, 8], DataType::F32));
    let u = builder.add_value("u", MemoryDesc::new(vec![4, 8], DataType::F32));
    let v = builder.add_value("v", MemoryDesc::new(vec![4, 8], DataType::F32));
    let y = builder.add_value("y", MemoryDesc::new(vec![4, 8], DataType::F32));

    builder.add_op(OpKind::MatMul, "mm", &[x, w], &[t]);
    let relu = builder.add_op(OpKind::Eltwise, "relu", &[t], &[u]);
    let gelu = builder.add_op(OpKind::Eltwise, "gelu", &[u], &[v]);
    builder.add_op(OpKind::Softmax, "softmax", &[v], &[y]);
    builder.set_inplace(relu, 0, 0)?;
    builder.set_inplace(gelu, 0, 0)?;
    builder.mark_input(x);
    builder.mark_input(w);
    builder.mark_output(y);
    let graph = builder.build()?;

    let mut planner = planner();
    planner.run(&graph)?;

    let root = planner.assignment(t).expect("t is assigned");
    assert_eq!(root.kind, BufferKind::InternalTemporary);
    assert_eq!(planner.assignment(u), Some(root));
    assert_eq!(planner.assignment(v), Some(root));

    // Each value keeps its own memory object bound to the shared key
    let set = planner.exec_args_set();
    let keys: Vec<usize> = [t, u, v]
        .iter()
        .map(|&value| {
            let mem = set.find_value_mem(value).expect("value is bound");
            set.mems_use_internal_temporary()
                .iter()
                .find(|(m, _)| *m == mem)
                .map(|(_, key)| *key)
                .expect("value is temporary")
        })
        .collect();
    assert_eq!(keys, vec![root.index; 3]);
    assert_eq!(planner.total_internal_temporary_size(), 128);
    Ok(())
}

#[test]
fn test_in_place_into_external_output() -> Result<()> {
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::bytes(64));
    let t = builder.add_value("t", MemoryDesc::bytes(64));
    let y = builder.add_value("y", MemoryDesc::bytes(64));
    builder.add_op(OpKind::Reorder, "reorder", &[x], &[t]);
    let relu = builder.add_op(OpKind::Eltwise, "relu", &[t], &[y]);
    builder.set_inplace(relu, 0, 0)?;
    builder.mark_input(x);
    builder.mark_output(y);
    let graph = builder.build()?;

    let mut planner = planner();
    planner.run(&graph)?;
    assert_eq!(planner.memory_info(t), "external_out_0");
    assert_eq!(planner.memory_info(y), "external_out_0");
    assert_eq!(planner.total_internal_temporary_size(), 0);
    Ok(())
}

#[test]
fn test_external_values_keep_declared_positions() -> Result<()> {
    let mut builder = SubgraphBuilder::new();
    let a = builder.add_value("a", MemoryDesc::bytes(32));
    let b = builder.add_value("b", MemoryDesc::bytes(32));
    let c = builder.add_value("c", MemoryDesc::bytes(32));
    let sum = builder.add_value("sum", MemoryDesc::bytes(32));
    let p = builder.add_value("p", MemoryDesc::bytes(32));
    let q = builder.add_value("q", MemoryDesc::bytes(32));

    builder.add_op(OpKind::Sum, "sum", &[a, b, c], &[sum]);
    builder.add_op(OpKind::Add, "p", &[sum, a], &[p]);
    builder.add_op(OpKind::Maximum, "q", &[sum, b], &[q]);
    builder.mark_input(c);
    builder.mark_input(a);
    builder.mark_input(b);
    builder.mark_output(q);
    builder.mark_output(p);
    let graph = builder.build()?;

    let mut planner = planner();
    planner.run(&graph)?;

    assert_eq!(planner.memory_info(c), "external_in_0");
    assert_eq!(planner.memory_info(a), "external_in_1");
    assert_eq!(planner.memory_info(b), "external_in_2");
    assert_eq!(planner.memory_info(q), "external_out_0");
    assert_eq!(planner.memory_info(p), "external_out_1");
    assert_eq!(planner.memory_info(sum), "temporary_0");

    let set = planner.exec_args_set();
    let c_mem = set.find_value_mem(c).expect("c is bound");
    assert!(set.mems_use_external_inputs().contains(&(c_mem, 0)));
    assert_eq!(set.mems_use_external_inputs().len(), 3);
    assert_eq!(set.mems_use_external_outputs().len(), 2);

    let first = &set.exec_args()[0];
    let c_arg = first.get(&ExecArg::MultipleSrc(2)).expect("c is a source");
    assert_eq!(c_arg.mem, c_mem);
    assert!(c_arg.is_const);
    assert!(!first.get(&ExecArg::Dst).expect("sum has a dst").is_const);
    Ok(())
}

#[test]
fn test_value_declared_input_and_output_is_rejected() {
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::bytes(16));
    let y = builder.add_value("y", MemoryDesc::bytes(16));
    builder.add_op(OpKind::Eltwise, "relu", &[x], &[y]);
    builder.mark_input(x);
    builder.mark_output(y);
    builder.mark_output(x);

    assert!(matches!(builder.build(), Err(Error::InvalidGraph(_))));
}

#[test]
fn test_zero_sized_values_take_no_arena_space() -> Result<()> {
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::bytes(100));
    let empty = builder.add_value("empty", MemoryDesc::new(vec![0, 8], DataType::F32));
    let b = builder.add_value("b", MemoryDesc::bytes(100));
    let y = builder.add_value("y", MemoryDesc::bytes(100));
    builder.add_op(OpKind::Eltwise, "shrink", &[x], &[empty]);
    builder.add_op(OpKind::Reorder, "grow", &[empty], &[b]);
    builder.add_op(OpKind::Eltwise, "relu", &[b], &[y]);
    builder.mark_input(x);
    builder.mark_output(y);
    let graph = builder.build()?;

    let mut planner = planner();
    planner.run(&graph)?;

    assert_eq!(planner.memory_info(empty), "temporary_none");
    assert_eq!(planner.memory_info(b), "temporary_0");
    assert_eq!(planner.total_internal_temporary_size(), 100);
    assert_eq!(planner.temporary_registry().len(), 1);

    let mut set = planner.exec_args_set().clone_set();
    let mut arena = vec![0u8; planner.total_internal_temporary_size()];
    let mut input = vec![0u8; 100];
    let mut output = vec![0u8; 100];
    set.bind_addresses(
        &[input.as_mut_ptr()],
        &[output.as_mut_ptr()],
        &planner.internal_temporary_grantor(arena.as_mut_ptr()),
        &planner.internal_persistent_grantor(std::ptr::null_mut()),
    )?;

    let handle = |value: ValueId| {
        let mem = set.find_value_mem(value).expect("value is bound");
        set.memory(mem).and_then(|m| m.data_handle())
    };
    assert!(handle(empty).is_none());
    assert_eq!(
        handle(b).map(|ptr| ptr.as_ptr() as usize),
        Some(arena.as_ptr() as usize)
    );
    assert!(handle(x).is_some());
    Ok(())
}

#[test]
fn test_scratchpads_are_recycled() -> Result<()> {
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::bytes(100));
    let w = builder.add_value("w", MemoryDesc::bytes(100));
    let t = builder.add_value("t", MemoryDesc::bytes(100));
    let y = builder.add_value("y", MemoryDesc::bytes(100));
    let s0 = builder.add_value("scratch0", MemoryDesc::bytes(64));
    let s1 = builder.add_value("scratch1", MemoryDesc::bytes(64));
    builder.add_op(OpKind::Convolution, "conv0", &[x, w], &[t, s0]);
    builder.add_op(OpKind::Convolution, "conv1", &[t, w], &[y, s1]);
    builder.mark_input(x);
    builder.mark_input(w);
    builder.mark_output(y);
    let graph = builder.build()?;

    let mut planner = planner();
    planner.run(&graph)?;

    assert_eq!(planner.memory_info(t), "temporary_0");
    assert_eq!(planner.memory_info(s0), "temporary_1");
    assert_eq!(planner.memory_info(s1), "temporary_1");

    let args = &planner.exec_args_set().exec_args()[1];
    assert!(args.contains_key(&ExecArg::Scratchpad));
    assert!(!args.contains_key(&ExecArg::Bias));
    Ok(())
}

#[test]
fn test_persistent_values_are_not_shared_with_temporaries() -> Result<()> {
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::bytes(128));
    let w = builder.add_value("w", MemoryDesc::bytes(128));
    let packed = builder.add_value("packed", MemoryDesc::bytes(128));
    let t = builder.add_value("t", MemoryDesc::bytes(128));
    let y = builder.add_value("y", MemoryDesc::bytes(128));
    let pack = builder.add_op(OpKind::Reorder, "pack", &[w], &[packed]);
    builder.set_attribute(pack, attr::IS_CONSTANT, Attribute::Bool(true))?;
    builder.add_op(OpKind::MatMul, "mm", &[x, packed], &[t]);
    builder.add_op(OpKind::Eltwise, "relu", &[t], &[y]);
    builder.mark_input(x);
    builder.mark_input(w);
    builder.mark_output(y);
    let graph = builder.build()?;

    let mut planner = planner();
    planner.run(&graph)?;

    assert_eq!(
        planner.assignment(packed).map(|info| info.kind),
        Some(BufferKind::InternalPersistent)
    );
    assert_eq!(
        planner.assignment(t).map(|info| info.kind),
        Some(BufferKind::InternalTemporary)
    );
    assert_eq!(planner.total_internal_persistent_size(), 128);
    assert_eq!(planner.total_internal_temporary_size(), 128);
    Ok(())
}

#[test]
fn test_replicas_resolve_to_their_own_arena() -> Result<()> {
    let (graph, ids) = chain(100);
    let mut planner = planner();
    planner.run(&graph)?;

    let size = planner.total_internal_temporary_size();
    assert_eq!(size, 228);

    let mut replicas = planner.exec_args_set().replicate(2);
    let mut arenas = vec![vec![0u8; size], vec![0u8; size]];
    let mut input = vec![0u8; 100];
    let mut output = vec![0u8; 100];
    let persistent = planner.internal_persistent_grantor(std::ptr::null_mut());

    for (replica, arena) in replicas.iter_mut().zip(arenas.iter_mut()) {
        let temporary = planner.internal_temporary_grantor(arena.as_mut_ptr());
        replica.bind_addresses(
            &[input.as_mut_ptr()],
            &[output.as_mut_ptr()],
            &temporary,
            &persistent,
        )?;
    }

    let address = |replica: usize, value: ValueId| -> usize {
        let set = &replicas[replica];
        let mem = set.find_value_mem(value).expect("value is bound");
        set.memory(mem)
            .and_then(|m| m.data_handle())
            .map(|ptr| ptr.as_ptr() as usize)
            .expect("address attached")
    };

    for &value in &ids[1..4] {
        let first = address(0, value);
        let second = address(1, value);
        assert_ne!(first, second);
        assert_eq!(
            first - arenas[0].as_ptr() as usize,
            second - arenas[1].as_ptr() as usize
        );
    }
    // External buffers are the same caller memory in both replicas
    assert_eq!(address(0, ids[0]), address(1, ids[0]));

    // The master template never receives addresses
    let master = planner.exec_args_set();
    assert!(master.memories().iter().all(|m| m.data_handle().is_none()));
    Ok(())
}

#[test]
fn test_replicas_bind_on_separate_threads() -> Result<()> {
    let (graph, ids) = chain(256);
    let mut planner = planner();
    planner.run(&graph)?;

    let replicas = planner.exec_args_set().replicate(4);
    let size = planner.total_internal_temporary_size();
    let planner = &planner;
    let b = ids[2];

    std::thread::scope(|scope| {
        for mut replica in replicas {
            scope.spawn(move || {
                let mut arena = vec![0u8; size];
                let mut input = vec![0u8; 256];
                let mut output = vec![0u8; 256];
                let base = arena.as_mut_ptr();
                replica
                    .bind_addresses(
                        &[input.as_mut_ptr()],
                        &[output.as_mut_ptr()],
                        &planner.internal_temporary_grantor(base),
                        &planner.internal_persistent_grantor(std::ptr::null_mut()),
                    )
                    .expect("binding succeeds");

                let mem = replica.find_value_mem(b).expect("b is bound");
                let ptr = replica
                    .memory(mem)
                    .and_then(|m| m.data_handle())
                    .expect("address attached")
                    .as_ptr() as usize;
                let start = base as usize;
                assert!(ptr >= start && ptr < start + size);
            });
        }
    });
    Ok(())
}

#[test]
fn test_clear_then_rerun_is_identical() -> Result<()> {
    let (graph, ids) = chain(100);
    let mut planner = planner();
    planner.run(&graph)?;

    let infos: Vec<String> = ids.iter().map(|&v| planner.memory_info(v)).collect();
    let summary = planner.summary(&graph);
    let temporary = planner.total_internal_temporary_size();

    planner.clear();
    assert_eq!(planner.total_internal_temporary_size(), 0);
    assert!(ids.iter().all(|&v| planner.memory_info(v).is_empty()));

    planner.run(&graph)?;
    let again: Vec<String> = ids.iter().map(|&v| planner.memory_info(v)).collect();
    assert_eq!(infos, again);
    assert_eq!(planner.total_internal_temporary_size(), temporary);
    assert_eq!(planner.summary(&graph), summary);
    assert_eq!(planner.summary(&graph).to_json()?, summary.to_json()?);
    Ok(())
}

#[test]
fn test_malformed_subgraph_leaves_no_state() -> Result<()> {
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::bytes(16));
    let orphan = builder.add_value("orphan", MemoryDesc::bytes(16));
    let t = builder.add_value("t", MemoryDesc::bytes(16));
    let y = builder.add_value("y", MemoryDesc::bytes(16));
    builder.add_op(OpKind::Eltwise, "relu", &[x], &[t]);
    builder.add_op(OpKind::Add, "add", &[t, orphan], &[y]);
    builder.mark_input(x);
    builder.mark_output(y);
    let broken = builder.build()?;

    let mut planner = planner();
    let err = planner.run(&broken).unwrap_err();
    assert!(matches!(err, Error::InvalidGraph(_)));
    assert!(err.to_string().contains("orphan"));
    assert!(!planner.is_planned());
    assert!(planner.exec_args_set().exec_args().is_empty());
    assert_eq!(planner.total_internal_temporary_size(), 0);

    planner.clear();
    let (graph, _) = chain(16);
    planner.run(&graph)?;
    assert_eq!(planner.exec_args_set().exec_args().len(), 4);
    Ok(())
}

#[test]
fn test_unsupported_kind_fails_run() -> Result<()> {
    let mut builder = SubgraphBuilder::new();
    let x = builder.add_value("x", MemoryDesc::bytes(16));
    let y = builder.add_value("y", MemoryDesc::bytes(16));
    builder.add_op(OpKind::Wildcard, "placeholder", &[x], &[y]);
    builder.mark_input(x);
    builder.mark_output(y);
    let graph = builder.build()?;

    let mut planner = planner();
    assert!(matches!(
        planner.run(&graph),
        Err(Error::UnsupportedOperation(_))
    ));
    assert!(planner.memory_info(x).is_empty());
    Ok(())
}

#[test]
fn test_options_from_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{ "enable_memory_sharing": false, "alignment": 128 }}"#
    )?;

    let options = PlannerOptions::from_json_file(file.path())?;
    assert!(!options.enable_memory_sharing);
    assert_eq!(options.alignment, 128);
    assert_eq!(options.match_range, 16);

    let (graph, _) = chain(100);
    let mut planner = MemoryPlanner::new(options)?;
    planner.run(&graph)?;
    // 100 + pad to 128 twice, then 100
    assert_eq!(planner.total_internal_temporary_size(), 356);
    assert_eq!(planner.temporary_registry().alignment(), 128);

    assert!(PlannerOptions::from_json_file(file.path().with_extension("missing")).is_err());
    Ok(())
}

#[test]
fn test_random_chains_never_share_live_buffers() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..50 {
        let mut builder = SubgraphBuilder::new();
        let x = builder.add_value("x", MemoryDesc::bytes(rng.gen_range(1..=4096)));
        builder.mark_input(x);

        let mut produced = vec![x];
        let num_ops = rng.gen_range(2..40);
        for i in 0..num_ops {
            let out = builder.add_value(
                &format!("v{}", i),
                MemoryDesc::new(vec![rng.gen_range(1..=1024)], DataType::F32),
            );
            let last = produced[produced.len() - 1];
            if produced.len() > 1 && rng.gen_bool(0.4) {
                let skip = produced[rng.gen_range(0..produced.len())];
                builder.add_op(OpKind::Add, &format!("add{}", i), &[last, skip], &[out]);
            } else {
                builder.add_op(OpKind::Eltwise, &format!("eltwise{}", i), &[last], &[out]);
            }
            produced.push(out);
        }
        builder.mark_output(produced[produced.len() - 1]);
        let graph = builder.build()?;

        let mut planner = planner();
        planner.run(&graph)?;

        // (first op, last op, buffer) per temporary value
        let position = |op: graph_memplan::OpId| {
            graph.op_order().iter().position(|&o| o == op).expect("op is ordered")
        };
        let mut lives = Vec::new();
        for value in graph.values() {
            let info = match planner.assignment(value.id) {
                Some(info) if info.kind == BufferKind::InternalTemporary => info,
                _ => continue,
            };
            let (producer, _) = value.producer.expect("temporaries have producers");
            let start = position(producer);
            let end = value
                .consumers
                .iter()
                .map(|&(op, _)| position(op))
                .max()
                .unwrap_or(start);
            lives.push((start, end, info.index));
        }

        for (i, &(s1, e1, b1)) in lives.iter().enumerate() {
            for &(s2, e2, b2) in &lives[i + 1..] {
                let overlap = s1 <= e2 && s2 <= e1;
                assert!(!(overlap && b1 == b2), "live ranges share buffer {}", b1);
            }
        }

        // Every booked buffer fits inside the arena
        let registry: &Registry = planner.temporary_registry();
        for (_, entry) in registry.entries() {
            assert!(entry.offset + entry.size <= registry.size());
            assert_eq!(entry.offset % registry.alignment(), 0);
        }
    }
    Ok(())
}
