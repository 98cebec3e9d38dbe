use crate::{NsName, SymTable};
use wisp_prog::{Op, OpCmd};

fn path(s: &str) -> Vec<String> {
    s.split('.').map(|p| p.to_string()).collect()
}

#[test]
fn test_stdlib_registered() {
    let sym = SymTable::new(false);
    assert!(matches!(
        sym.lookup(&path("say")),
        Some(NsName::CmdOpcode(OpCmd::Variadic(Op::Say)))
    ));
    assert!(matches!(
        sym.lookup(&path("str.hash")),
        Some(NsName::CmdOpcode(OpCmd::Fixed(Op::StrHash, 2)))
    ));
    assert!(matches!(
        sym.lookup(&path("pickle.circular")),
        Some(NsName::CmdOpcode(_))
    ));
    assert_eq!(sym.lookup(&path("no.such.thing")), None);
}

#[test]
fn test_var_lookup_through_scopes() {
    let mut sym = SymTable::new(false);
    let (level, index) = sym.add_var("x").unwrap();
    assert_eq!((level, index), (0, 0));
    sym.push_scope();
    assert_eq!(
        sym.lookup(&path("x")),
        Some(NsName::Var { level: 0, index: 0 })
    );
    // Shadowing in the inner scope wins.
    let (_, inner) = sym.add_var("x").unwrap();
    assert_eq!(
        sym.lookup(&path("x")),
        Some(NsName::Var {
            level: 0,
            index: inner
        })
    );
    sym.pop_scope().unwrap();
    assert_eq!(
        sym.lookup(&path("x")),
        Some(NsName::Var { level: 0, index: 0 })
    );
}

#[test]
fn test_scope_pop_releases_slots() {
    let mut sym = SymTable::new(false);
    sym.push_scope();
    let (_, a) = sym.add_var("a").unwrap();
    sym.pop_scope().unwrap();
    // Slot is reusable afterwards.
    let (_, b) = sym.add_temp().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_duplicate_definition_errors() {
    let mut sym = SymTable::new(false);
    sym.add_var("x").unwrap();
    assert!(sym.add_var("x").is_err());
}

#[test]
fn test_repl_redefinition_replaces() {
    let mut sym = SymTable::new(true);
    sym.add_var("x").unwrap();
    let (_, index) = sym.add_var("x").unwrap();
    assert_eq!(
        sym.lookup(&path("x")),
        Some(NsName::Var { level: 0, index })
    );
}

#[test]
fn test_namespace_scoping() {
    let mut sym = SymTable::new(false);
    let pushed = sym.push_namespace(&path("game")).unwrap();
    sym.add_enum("width", 240.0).unwrap();
    sym.pop_namespaces(pushed);
    assert_eq!(sym.lookup(&path("width")), None);
    assert_eq!(
        sym.lookup(&path("game.width")),
        Some(NsName::EnumVal(240.0))
    );
}

#[test]
fn test_using_makes_names_visible() {
    let mut sym = SymTable::new(false);
    let pushed = sym.push_namespace(&path("game")).unwrap();
    sym.add_enum("width", 240.0).unwrap();
    sym.pop_namespaces(pushed);
    sym.using(&path("game")).unwrap();
    assert_eq!(sym.lookup(&path("width")), Some(NsName::EnumVal(240.0)));
}

#[test]
fn test_cyclic_usings_terminate() {
    let mut sym = SymTable::new(false);
    let a = sym.push_namespace(&path("a")).unwrap();
    sym.pop_namespaces(a);
    let b = sym.push_namespace(&path("b")).unwrap();
    sym.using(&path("a")).unwrap();
    sym.pop_namespaces(b);
    let a = sym.push_namespace(&path("a")).unwrap();
    sym.using(&path("b")).unwrap();
    // Lookup through the cycle must not loop.
    assert_eq!(sym.lookup(&path("missing")), None);
    sym.pop_namespaces(a);
}

#[test]
fn test_namespace_unique_models_include() {
    let mut sym = SymTable::new(false);
    sym.push_namespace_unique();
    sym.add_enum("included", 1.0).unwrap();
    sym.pop_namespaces(1);
    // Still visible through the automatic using edge.
    assert_eq!(sym.lookup(&path("included")), Some(NsName::EnumVal(1.0)));
}

#[test]
fn test_declare_then_define() {
    let mut sym = SymTable::new(false);
    let declared = sym.declare_cmd("f").unwrap();
    let defined = sym.define_cmd(&path("f")).unwrap();
    assert_eq!(declared, defined);
}

#[test]
fn test_undefined_declare_errors_at_scope_pop() {
    let mut sym = SymTable::new(false);
    sym.push_scope();
    sym.declare_cmd("ghost").unwrap();
    assert!(sym.pop_scope().is_err());
}

#[test]
fn test_frame_pop_with_unresolved_label_errors() {
    let mut sym = SymTable::new(false);
    sym.push_frame().unwrap();
    let lbl = sym.goto_label("nowhere");
    sym.label_mut(lbl).rewrites.push(3);
    assert!(sym.pop_frame().is_err());
}

#[test]
fn test_frame_pop_clean() {
    let mut sym = SymTable::new(false);
    sym.push_frame().unwrap();
    let lbl = sym.goto_label("here");
    sym.label_mut(lbl).pc = Some(0);
    assert!(sym.pop_frame().is_ok());
}

#[test]
fn test_cmd_levels_nest() {
    let mut sym = SymTable::new(false);
    sym.define_cmd(&path("outer")).unwrap();
    assert!(matches!(
        sym.lookup(&path("outer")),
        Some(NsName::CmdLocal { level: 1, .. })
    ));
    sym.push_frame().unwrap();
    sym.push_scope();
    sym.define_cmd(&path("inner")).unwrap();
    assert!(matches!(
        sym.lookup(&path("inner")),
        Some(NsName::CmdLocal { level: 2, .. })
    ));
}

#[test]
fn test_loop_labels_stop_at_frame_boundary() {
    let mut sym = SymTable::new(false);
    sym.push_scope();
    let brk = sym.new_label("loop_done");
    sym.set_loop_labels(brk, None);
    assert_eq!(sym.lbl_break(), Some(brk));
    // Inside a nested command, the outer loop is unreachable.
    sym.push_frame().unwrap();
    sym.push_scope();
    assert_eq!(sym.lbl_break(), None);
}

#[test]
fn test_temp_reuse_across_expressions() {
    let mut sym = SymTable::new(false);
    let (l1, i1) = sym.add_temp().unwrap();
    sym.release_temp(l1, i1);
    let (_, i2) = sym.add_temp().unwrap();
    assert_eq!(i1, i2);
    assert_eq!(sym.frame_size(), 1);
}
