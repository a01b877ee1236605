//! End-to-end parser header commoning scenarios.

mod common;

use std::rc::Rc;

use common::*;
use p4midend::ir::{Decl, ExprKind, Statement, Type};
use p4midend::{common_headers, Diagnostics, MidendError};

fn two_successor_program() -> p4midend::ir::P<p4midend::ir::Program> {
    let s0 = state(
        "s0",
        vec![],
        select(num(0), &[(1, "s1"), (2, "s2")]),
    );
    let s1 = state("s1", vec![extract("A")], goto("accept"));
    let s2 = state("s2", vec![extract("B")], goto("accept"));
    let ingress = control(
        "ingress",
        vec![],
        vec![],
        vec![Statement::assign(meta_field("a"), hdr_field("A", "x", 8))],
    );
    p4midend::ir::Program::new(vec![
        header(
            "A",
            &[
                ("x", Type::Bits(8)),
                ("y", Type::Bits(16)),
                ("z", Type::Bits(4)),
            ],
        ),
        header(
            "B",
            &[
                ("x", Type::Bits(8)),
                ("y", Type::Bits(16)),
                ("w", Type::Bits(8)),
            ],
        ),
        headers_struct(&["A", "B"]),
        parser("p", vec![s0, s1, s2]),
        ingress,
    ])
}

#[test]
fn two_successor_prefix_commoning() {
    let prog = two_successor_program();
    let diag = Diagnostics::silent();
    let out = common_headers(&prog, &diag).unwrap();

    // New common header declared immediately before A.
    let common = find_header(&out, "A_common_0").expect("common header declared");
    assert_eq!(common.fields.len(), 2);
    assert_eq!(common.fields[0].name, "x");
    assert_eq!(common.fields[0].ty, Type::Bits(8));
    assert_eq!(common.fields[1].name, "y");
    assert_eq!(common.fields[1].ty, Type::Bits(16));
    let pos_common = decl_position(&out, "A_common_0").unwrap();
    let pos_a = decl_position(&out, "A").unwrap();
    assert_eq!(pos_common + 1, pos_a);

    // Residual headers.
    let a = find_header(&out, "A").unwrap();
    assert_eq!(a.fields.len(), 1);
    assert_eq!(a.fields[0].name, "z");
    let b = find_header(&out, "B").unwrap();
    assert_eq!(b.fields.len(), 1);
    assert_eq!(b.fields[0].name, "w");

    // The headers struct gains the common instance.
    let headers = out
        .declarations
        .iter()
        .find_map(|d| match d {
            Decl::Struct(s) if s.name == "headers" => Some(Rc::clone(s)),
            _ => None,
        })
        .unwrap();
    let added = headers.fields.last().unwrap();
    assert_eq!(added.name, "A_common_0_in_hdr");
    assert_eq!(added.ty, Type::Header("A_common_0".to_string()));

    // Both extracting states gain a leading extract of the common instance.
    for name in ["s1", "s2"] {
        let st = find_state(&out, name).unwrap();
        assert!(
            is_extract_of(&st.components[0], "A_common_0_in_hdr"),
            "state {} should lead with the common extract",
            name
        );
        assert_eq!(st.components.len(), 2);
    }
    // The branch state itself gains nothing.
    let s0 = find_state(&out, "s0").unwrap();
    assert!(s0.components.is_empty());

    // Absorbed field reads are retargeted.
    let ingress = out.find_control("ingress").unwrap();
    let rhs = match &*ingress.body[0] {
        Statement::Assignment { rhs, .. } => rhs,
        other => panic!("unexpected statement {:?}", other),
    };
    match &rhs.kind {
        ExprKind::Member { base, member } => {
            assert_eq!(member, "x");
            match &base.kind {
                ExprKind::Member { member, .. } => assert_eq!(member, "A_common_0_in_hdr"),
                other => panic!("unexpected base {:?}", other),
            }
            assert_eq!(base.ty, Type::Header("A_common_0".to_string()));
        }
        other => panic!("unexpected rhs {:?}", other),
    }
}

#[test]
fn no_commoning_on_width_mismatch() {
    let s0 = state(
        "s0",
        vec![],
        select(num(0), &[(1, "s1"), (2, "s2")]),
    );
    let s1 = state("s1", vec![extract("A")], goto("accept"));
    let s2 = state("s2", vec![extract("B")], goto("accept"));
    let prog = p4midend::ir::Program::new(vec![
        header(
            "A",
            &[
                ("x", Type::Bits(8)),
                ("y", Type::Bits(16)),
                ("z", Type::Bits(4)),
            ],
        ),
        header(
            "B",
            &[
                ("x", Type::Bits(8)),
                ("y", Type::Bits(12)),
                ("w", Type::Bits(8)),
            ],
        ),
        headers_struct(&["A", "B"]),
        parser("p", vec![s0, s1, s2]),
    ]);
    let diag = Diagnostics::silent();
    let out = common_headers(&prog, &diag).unwrap();
    assert!(Rc::ptr_eq(&out, &prog), "program must come back unchanged");
}

#[test]
fn varbit_bounds_the_common_prefix() {
    let s0 = state(
        "s0",
        vec![],
        select(num(0), &[(1, "s1"), (2, "s2")]),
    );
    let s1 = state("s1", vec![extract("C")], goto("accept"));
    let s2 = state("s2", vec![extract("D")], goto("accept"));
    let prog = p4midend::ir::Program::new(vec![
        header("C", &[("x", Type::Bits(8)), ("v", Type::Varbits(32))]),
        header("D", &[("x", Type::Bits(8)), ("w", Type::Bits(32))]),
        headers_struct(&["C", "D"]),
        parser("p", vec![s0, s1, s2]),
    ]);
    let diag = Diagnostics::silent();
    let out = common_headers(&prog, &diag).unwrap();

    let common = find_header(&out, "C_common_0").expect("common header declared");
    assert_eq!(common.fields.len(), 1);
    assert_eq!(common.fields[0].name, "x");
    let c = find_header(&out, "C").unwrap();
    assert_eq!(c.fields.len(), 1);
    assert_eq!(c.fields[0].name, "v");
    assert!(c.fields[0].ty.is_varbits());
    let d = find_header(&out, "D").unwrap();
    assert_eq!(d.fields.len(), 1);
    assert_eq!(d.fields[0].name, "w");
}

#[test]
fn commoning_twice_is_idempotent() {
    let prog = two_successor_program();
    let diag = Diagnostics::silent();
    let once = common_headers(&prog, &diag).unwrap();
    let twice = common_headers(&once, &diag).unwrap();
    assert_eq!(*twice, *once, "second run must change nothing");

    let common_count = twice
        .declarations
        .iter()
        .filter(|d| d.name().contains("_common_"))
        .count();
    assert_eq!(common_count, 1);
}

#[test]
fn counter_and_positional_names_are_deterministic() {
    // Two independent branch points; plans are made in state-name order, so
    // the counters land predictably, and field retargeting is positional.
    let s0 = state(
        "s0",
        vec![],
        select(num(0), &[(1, "s1"), (2, "s2")]),
    );
    let s1 = state("s1", vec![extract("A")], goto("t0"));
    let s2 = state("s2", vec![extract("B")], goto("t0"));
    let t0 = state(
        "t0",
        vec![],
        select(num(0), &[(1, "t1"), (2, "t2")]),
    );
    let t1 = state("t1", vec![extract("C")], goto("accept"));
    let t2 = state("t2", vec![extract("D")], goto("accept"));
    let egress = control(
        "egress",
        vec![],
        vec![],
        vec![Statement::assign(meta_field("b"), hdr_field("D", "d1", 8))],
    );
    let prog = p4midend::ir::Program::new(vec![
        header("A", &[("x", Type::Bits(8)), ("z", Type::Bits(4))]),
        header("B", &[("x", Type::Bits(8)), ("w", Type::Bits(8))]),
        header("C", &[("c1", Type::Bits(8)), ("c2", Type::Bits(32))]),
        header("D", &[("d1", Type::Bits(8)), ("d2", Type::Bits(16))]),
        headers_struct(&["A", "B", "C", "D"]),
        parser("p", vec![s0, s1, s2, t0, t1, t2]),
        egress,
    ]);
    let diag = Diagnostics::silent();
    let out = common_headers(&prog, &diag).unwrap();

    assert!(find_header(&out, "A_common_0").is_some());
    assert!(find_header(&out, "C_common_1").is_some());

    // hdr.D.d1 retargets to the common header's field at the same ordinal,
    // which keeps C's name for it.
    let egress = out.find_control("egress").unwrap();
    let rhs = match &*egress.body[0] {
        Statement::Assignment { rhs, .. } => rhs,
        other => panic!("unexpected statement {:?}", other),
    };
    match &rhs.kind {
        ExprKind::Member { base, member } => {
            assert_eq!(member, "c1");
            match &base.kind {
                ExprKind::Member { member, .. } => assert_eq!(member, "C_common_1_in_hdr"),
                other => panic!("unexpected base {:?}", other),
            }
        }
        other => panic!("unexpected rhs {:?}", other),
    }
}

#[test]
fn identical_successor_headers_common_fully() {
    let s0 = state(
        "s0",
        vec![],
        select(num(0), &[(1, "s1"), (2, "s2")]),
    );
    let s1 = state("s1", vec![extract("A")], goto("accept"));
    let s2 = state("s2", vec![extract("A")], goto("accept"));
    let prog = p4midend::ir::Program::new(vec![
        header("A", &[("x", Type::Bits(8)), ("y", Type::Bits(16))]),
        headers_struct(&["A"]),
        parser("p", vec![s0, s1, s2]),
    ]);
    let diag = Diagnostics::silent();
    let out = common_headers(&prog, &diag).unwrap();

    let common = find_header(&out, "A_common_0").expect("common header declared");
    assert_eq!(common.fields.len(), 2);
    let residual = find_header(&out, "A").unwrap();
    assert!(residual.fields.is_empty());
}

#[test]
fn reserved_header_names_are_rejected() {
    let prog = p4midend::ir::Program::new(vec![
        header("evil_common_hdr", &[("x", Type::Bits(8))]),
        parser("p", vec![state("s0", vec![], goto("accept"))]),
    ]);
    let diag = Diagnostics::silent();
    assert!(matches!(
        common_headers(&prog, &diag),
        Err(MidendError::ReservedHeaderName(_))
    ));
}
