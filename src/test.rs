use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use pretty_assertions::assert_eq;

use crate::isa::mini::{MiniIsa, R0, SP};
use crate::*;

/// Image of mini-ISA code loaded at address 0, zero padded to `len`.
fn image(parts: &[(u64, &[u8])], len: usize) -> Section {
    let mut data = vec![0u8; len];
    for (at, bytes) in parts {
        data[*at as usize..*at as usize + bytes.len()].copy_from_slice(bytes);
    }
    Section::new(0, data)
}

fn world_with(sec: Section, config: WorldConfig) -> (World, DomainId) {
    let mut world = World::new(config);
    let dom = world.add_domain(Arc::new(MiniIsa::new()));
    world.add_code(dom, sec);
    (world, dom)
}

fn decompile(sec: Section, entry: u64, want: &[RegId]) -> (World, FuncId) {
    let (mut world, dom) = world_with(sec, WorldConfig::default());
    let f = world.add_function(dom, entry, Some("main")).unwrap();
    for reg in want {
        world.want_reg(f, *reg, 0xffff_ffff);
    }
    world.process().unwrap();
    (world, f)
}

fn store_addr(world: &World, f: FuncId, at: u64) -> Expr {
    let body = world.func(f).body.as_ref().unwrap();
    let block = body.block_at(at).unwrap();
    match block.ops.iter().find(|op| matches!(op, Op::Store { .. })) {
        Some(Op::Store { addr, .. }) => addr.clone(),
        other => panic!("no store in {}: {other:?}", block.name),
    }
}

#[test]
fn branch_on_constant_structures_as_if() {
    let sec = image(
        &[
            (0x00, &[0x01, 0x00, 0x05, 0x00]), // movi r0, 5
            (0x04, &[0x27, 0x00, 0x0d, 0x00]), // beqz r0, 0x0d
            (0x08, &[0x01, 0x00, 0x02, 0x00]), // movi r0, 2
            (0x0c, &[0x2c]),                   // ret
            (0x0d, &[0x01, 0x00, 0x01, 0x00]), // movi r0, 1
            (0x11, &[0x2c]),                   // ret
        ],
        0x12,
    );
    let (world, f) = decompile(sec, 0, &[R0]);
    let func = world.func(f);
    assert_eq!(func.error, None);
    assert_eq!(func.passes, 1);
    assert_eq!(func.sig.rets, Some(BTreeSet::from([R0])));
    assert!(func.sig.args.is_empty());

    let expected = vec![
        Stmt::Block(ENTRY),
        Stmt::If {
            node: BlockId(1),
            join: None,
            arms: vec![vec![Stmt::Block(BlockId(3))], vec![Stmt::Block(BlockId(2))]],
        },
    ];
    assert_eq!(func.structure(), Some(&expected));

    let body = func.body.as_ref().unwrap();
    let Some(Terminator::Branch { pred, .. }) = body.block_at(0).map(|b| &b.term) else {
        panic!("entry block should branch")
    };
    assert_eq!(pred, &Expr::Const(0));

    let isa = MiniIsa::new();
    let text = func.render(&IsaDisplay::with_world(&isa, &world));
    assert!(text.starts_with("def main() -> (r0):"), "{text}");
    assert!(text.contains("if 0x0:"), "{text}");
    assert!(text.contains("return 0x1"), "{text}");
    assert!(text.contains("return 0x2"), "{text}");
}

#[test]
fn callee_return_interest_reaches_caller() {
    let sec = image(
        &[
            (0x00, &[0x24, 0x00, 0x20, 0x00]), // call 0x20
            (0x04, &[0x2c]),                   // ret
            (0x20, &[0x01, 0x00, 0x07, 0x00]), // movi r0, 7
            (0x24, &[0x2c]),                   // ret
        ],
        0x25,
    );
    let (world, f) = decompile(sec, 0, &[R0]);
    let g = world.domain(DomainId(0)).objects[&("C".to_string(), 0x20)];
    let (fm, gm) = (world.func(f), world.func(g));

    assert_eq!(fm.passes, 2);
    assert_eq!(gm.passes, 2);
    assert_eq!(fm.sig.rets, Some(BTreeSet::from([R0])));
    assert_eq!(gm.sig.rets, Some(BTreeSet::from([R0])));
    assert_eq!(gm.wanted.get(&R0), Some(&0xffff_ffff));
    assert!(gm.deps.contains(&f));
    assert!(fm.sig.args.is_empty());

    let body = fm.body.as_ref().unwrap();
    let call = body.block_at(0).unwrap();
    assert!(matches!(&call.term, Terminator::RetCall { callee, rets, .. } if *callee == g && rets.contains_key(&R0)));
}

#[test]
fn mutual_recursion_settles() {
    let sec = image(
        &[
            (0x00, &[0x27, 0x00, 0x0c, 0x00]), // beqz r0, 0x0c
            (0x04, &[0x24, 0x00, 0x20, 0x00]), // call 0x20
            (0x08, &[0x2c]),                   // ret
            (0x0c, &[0x01, 0x01, 0x03, 0x00]), // movi r1, 3
            (0x10, &[0x2c]),                   // ret
            (0x20, &[0x08, 0x00, 0xff, 0xff]), // addi r0, -1
            (0x24, &[0x24, 0x00, 0x00, 0x00]), // call 0x00
            (0x28, &[0x2c]),                   // ret
        ],
        0x29,
    );
    let r1 = RegId(1);
    for first in [0x00, 0x20] {
        let (mut world, dom) = world_with(sec.clone(), WorldConfig::default());
        let a = world.add_function(dom, first, None).unwrap();
        let b = world.add_function(dom, first ^ 0x20, None).unwrap();
        let f = if first == 0 { a } else { b };
        world.want_reg(f, r1, 0xffff_ffff);
        world.process().unwrap();

        let g = if first == 0 { b } else { a };
        let (fm, gm) = (world.func(f), world.func(g));
        assert!(fm.error.is_none() && gm.error.is_none());
        assert!(fm.sig.rets.as_ref().is_some_and(|r| r.contains(&r1)));
        assert!(gm.sig.rets.as_ref().is_some_and(|r| r.contains(&r1)));
        assert_eq!(fm.sig.args.get(&R0), Some(&0xffff_ffff));
        assert!(gm.sig.args.contains_key(&R0));
        assert!(is_cyclic_directed(&build_call_graph(&world)));
    }
}

const STACK_PATHS: &[(u64, &[u8])] = &[
    (0x00, &[0x27, 0x00, 0x0c, 0x00]), // beqz r0, 0x0c
    (0x04, &[0x08, 0x08, 0xf8, 0xff]), // addi sp, -8
    (0x08, &[0x20, 0x00, 0x14, 0x00]), // jmp 0x14
    (0x0c, &[0x08, 0x08, 0xfc, 0xff]), // addi sp, -4
    (0x10, &[0x08, 0x08, 0xfc, 0xff]), // addi sp, -4
    (0x14, &[0x11, 0x81, 0x00, 0x00]), // st [sp+0], r1
    (0x18, &[0x2c]),                   // ret
];

#[test]
fn stack_offsets_agree_across_paths() {
    let (world, f) = decompile(image(STACK_PATHS, 0x19), 0, &[]);
    let addr = store_addr(&world, f, 0x14);
    let canon = addr.as_offset().map(|(v, off, _)| (v.kind, off & 0xffff_ffff));
    assert_eq!(canon, Some((VarKind::Parm(SP), 0xffff_fff8)));
    assert_eq!(world.func(f).sig.args.get(&SP), Some(&0xffff_ffff));
}

#[test]
fn disagreeing_stack_offsets_poison() {
    let mut parts = STACK_PATHS.to_vec();
    parts[4] = (0x10, &[0x00, 0x00, 0x00, 0x00]); // nop x4
    let (world, f) = decompile(image(&parts, 0x19), 0, &[]);
    let addr = store_addr(&world, f, 0x14);
    let Some(var) = addr.as_var() else { panic!("expected a bare input, got {addr}") };
    assert_eq!(var.kind, VarKind::In(SP));
    let body = world.func(f).body.as_ref().unwrap();
    assert_eq!(body.sp_offsets.get(&var), Some(&None));
}

#[test]
fn decode_error_stays_with_its_function() {
    let sec = image(
        &[
            (0x00, &[0x24, 0x00, 0x20, 0x00]), // call 0x20
            (0x04, &[0x2c]),                   // ret
            (0x20, &[0xff]),                   // not an opcode
        ],
        0x21,
    );
    let (world, f) = decompile(sec, 0, &[R0]);
    let g = world.domain(DomainId(0)).objects[&("C".to_string(), 0x20)];
    let gm = world.func(g);
    assert!(matches!(gm.error, Some(DecoError::Decode(DecodeError::Opcode { pos: 0x20, .. }))));
    assert!(gm.body.is_none());

    let fm = world.func(f);
    assert_eq!(fm.error, None);
    assert!(fm.structure().is_some());
    // the call never returns as far as anyone can tell
    assert_eq!(fm.sig.rets, None);
}

#[test]
fn overlapping_instructions_fail_cleanly() {
    let sec = image(
        &[
            (0x00, &[0x01, 0x00, 0x01, 0x00]), // movi r0, 1
            (0x04, &[0x27, 0x00, 0x02, 0x00]), // beqz r0, 0x02
            (0x08, &[0x2c]),                   // ret
        ],
        0x09,
    );
    let (world, f) = decompile(sec, 0, &[]);
    let fm = world.func(f);
    assert_eq!(fm.error, Some(DecoError::Decode(DecodeError::MidInstruction { limit: 2, pos: 0 })));
    assert!(!fm.processed);
    assert!(fm.render(&DefaultDisplay).contains("block limit 0x2"));
}

#[test]
fn pass_limit_reports_non_convergence() {
    let sec = image(
        &[
            (0x00, &[0x24, 0x00, 0x20, 0x00]), // call 0x20
            (0x04, &[0x2c]),                   // ret
            (0x20, &[0x01, 0x00, 0x07, 0x00]), // movi r0, 7
            (0x24, &[0x2c]),                   // ret
        ],
        0x25,
    );
    let (mut world, dom) = world_with(sec, WorldConfig { max_passes: 1 });
    let f = world.add_function(dom, 0, None).unwrap();
    world.want_reg(f, R0, 0xffff_ffff);
    let err = world.process().unwrap_err();
    assert_eq!(err, WorldError::NonConvergent { func: "func_20".to_string(), passes: 1 });
    let g = world.domain(dom).objects[&("C".to_string(), 0x20)];
    assert!(world.func(g).stalled);
}

#[test]
fn block_graph_dot() {
    let (world, f) = decompile(image(STACK_PATHS, 0x19), 0, &[]);
    let cfg = build_cfg(world.func(f).body.as_ref().unwrap());
    assert!(cfg.node_count() >= 3);
    let dot = graph_to_dot(&cfg);
    assert!(dot.starts_with("digraph CFG {"));
    assert!(dot.contains("main_14"));
}

#[test]
fn merged_input_forwards_through_jump() {
    let sec = image(
        &[
            (0x00, &[0x27, 0x00, 0x0c, 0x00]), // beqz r0, 0x0c
            (0x04, &[0x01, 0x01, 0x01, 0x00]), // movi r1, 1
            (0x08, &[0x20, 0x00, 0x10, 0x00]), // jmp 0x10
            (0x0c, &[0x01, 0x01, 0x02, 0x00]), // movi r1, 2
            (0x10, &[0x11, 0x20, 0x00, 0x00]), // st [r2+0], r0
            (0x14, &[0x20, 0x00, 0x18, 0x00]), // jmp 0x18
            (0x18, &[0x11, 0x21, 0x04, 0x00]), // st [r2+4], r1
            (0x1c, &[0x2c]),                   // ret
        ],
        0x1d,
    );
    let (world, f) = decompile(sec, 0, &[]);
    let body = world.func(f).body.as_ref().unwrap();
    let join = body.block_at(0x10).unwrap();
    let tail = body.block_at(0x18).unwrap();
    let r1 = RegId(1);

    let merged = join.inregs[&r1];
    assert!(!tail.inregs.contains_key(&r1), "{:?}", tail.inregs);
    match tail.ops.iter().find(|op| matches!(op, Op::Store { .. })) {
        Some(Op::Store { src, .. }) => assert_eq!(src, &Expr::Var(merged)),
        other => panic!("no store in {}: {other:?}", tail.name),
    }
}

#[test]
fn constant_register_call_is_discovered() {
    let sec = image(
        &[
            (0x00, &[0x01, 0x01, 0x20, 0x00]), // movi r1, 0x20
            (0x04, &[0x20, 0x00, 0x08, 0x00]), // jmp 0x08
            (0x08, &[0x25, 0x01]),             // callr r1
            (0x0a, &[0x2c]),                   // ret
            (0x20, &[0x01, 0x00, 0x07, 0x00]), // movi r0, 7
            (0x24, &[0x2c]),                   // ret
        ],
        0x25,
    );
    let (world, f) = decompile(sec, 0, &[R0]);
    let g = world.domain(DomainId(0)).objects[&("C".to_string(), 0x20)];
    let fm = world.func(f);

    assert_eq!(fm.error, None);
    assert_eq!(fm.callees, BTreeMap::from([(0x0a, 0x20)]));
    assert_eq!(fm.sig.rets, Some(BTreeSet::from([R0])));
    assert!(world.func(g).deps.contains(&f));

    let body = fm.body.as_ref().unwrap();
    let call = body.block_at(0x08).unwrap();
    assert!(matches!(&call.term, Terminator::RetCall { callee, .. } if *callee == g), "{:?}", call.term);
}

#[test]
fn empty_block_is_glued_away() {
    let sec = image(
        &[
            (0x00, &[0x27, 0x00, 0x08, 0x00]), // beqz r0, 0x08
            (0x04, &[0x20, 0x00, 0x10, 0x00]), // jmp 0x10
            (0x08, &[0x11, 0x20, 0x00, 0x00]), // st [r2+0], r0
            (0x0c, &[0x01, 0x01, 0x03, 0x00]), // movi r1, 3
            (0x10, &[0x2c]),                   // ret
        ],
        0x11,
    );
    let r1 = RegId(1);
    let (world, f) = decompile(sec, 0, &[r1]);
    let func = world.func(f);
    assert_eq!(func.sig.rets, Some(BTreeSet::from([r1])));

    let body = func.body.as_ref().unwrap();
    assert!(body.block_at(0x04).is_none());
    let (head, _) = body.blocks.iter().find(|(_, b)| !b.is_entry && b.start == 0).unwrap();
    let (exit, exit_block) = body.blocks.iter().find(|(_, b)| b.start == 0x10).unwrap();
    assert_eq!(body.blocks[head].outs[1], Some(*exit));
    assert!(exit_block.ins.contains(&(*head, 1)), "{:?}", exit_block.ins);

    let isa = MiniIsa::new();
    let text = func.render(&IsaDisplay::with_world(&isa, &world));
    assert!(text.contains("else:"), "{text}");
    assert!(!text.contains("pass"), "{text}");
}

#[test]
fn new_return_interest_redirties() {
    let (mut world, f) = decompile(image(STACK_PATHS, 0x19), 0, &[]);
    assert!(!world.is_dirty(f));
    world.want_reg(f, RegId(3), 0xffff_ffff);
    assert!(world.is_dirty(f));
    world.want_reg(f, RegId(3), 0xff);
    world.process().unwrap();
    assert!(!world.is_dirty(f));
}
