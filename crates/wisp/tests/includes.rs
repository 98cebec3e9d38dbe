//! Include and embed resolution through a filesystem-backed resolver.

use std::fs;
use std::path::PathBuf;
use wisp::{run_with, Collector, FsType, IncludeResolver, RunResult, Script};

/// Resolver rooted in a temporary directory.
struct DirResolver {
    root: PathBuf,
}

impl IncludeResolver for DirResolver {
    fn fs_type(&mut self, path: &[u8]) -> FsType {
        let p = self.root.join(String::from_utf8_lossy(path).as_ref());
        if p.is_file() {
            FsType::File
        } else if p.is_dir() {
            FsType::Dir
        } else {
            FsType::None
        }
    }

    fn read(&mut self, path: &[u8]) -> Option<Vec<u8>> {
        let p = self.root.join(String::from_utf8_lossy(path).as_ref());
        fs::read(p).ok()
    }
}

fn script_in(dir: &tempfile::TempDir) -> Script {
    Script::with_resolver(
        false,
        Box::new(DirResolver {
            root: dir.path().to_path_buf(),
        }),
    )
}

fn run_script(mut script: Script, source: &str) -> Vec<String> {
    script.write(source.as_bytes()).unwrap();
    script.close().unwrap();
    let mut ctx = script.context();
    let mut host = Collector::default();
    assert_eq!(
        run_with(&mut ctx, &mut host),
        RunResult::Pass,
        "{:?}",
        ctx.err()
    );
    host.said
        .iter()
        .map(|l| String::from_utf8_lossy(l).into_owned())
        .collect()
}

#[test]
fn test_plain_include_shares_names() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("util.wisp"), "def twice a\nreturn a * 2\nend\n").unwrap();
    let out = run_script(script_in(&dir), "include 'util.wisp'\nsay twice 21\n");
    assert_eq!(out, vec!["42"]);
}

#[test]
fn test_namespaced_include() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("gfx.wisp"), "enum width = 240\n").unwrap();
    let out = run_script(
        script_in(&dir),
        "include gfx 'gfx.wisp'\nsay gfx.width\n",
    );
    assert_eq!(out, vec!["240"]);
}

#[test]
fn test_nested_includes_resolve_relative() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("lib")).unwrap();
    fs::write(dir.path().join("lib/a.wisp"), "include 'b.wisp'\n").unwrap();
    fs::write(dir.path().join("lib/b.wisp"), "enum deep = 9\n").unwrap();
    let out = run_script(script_in(&dir), "include 'lib/a.wisp'\nsay deep\n");
    assert_eq!(out, vec!["9"]);
}

#[test]
fn test_missing_include_is_compile_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut script = script_in(&dir);
    let err = script.write(b"include 'nope.wisp'\n").unwrap_err();
    assert!(err.to_string().contains("nope.wisp"));
}

#[test]
fn test_embed_inlines_file_bytes() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("data.bin"), [1u8, 2, 3, 4]).unwrap();
    let out = run_script(
        script_in(&dir),
        "var d = embed 'data.bin'\nsay &d\nsay str.byte d, 2\n",
    );
    assert_eq!(out, vec!["4", "3"]);
}

#[test]
fn test_include_positions_name_their_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("bad.wisp"), "say 1 +\n").unwrap();
    let mut script = script_in(&dir);
    let err = script.write(b"include 'bad.wisp'\n").unwrap_err();
    assert!(err.to_string().contains("bad.wisp"), "got {}", err);
}

#[test]
fn test_load_file_entry_point() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.wisp"), "say 'loaded'\n").unwrap();
    let mut script = script_in(&dir);
    script.load_file("main.wisp").unwrap();
    let mut ctx = script.context();
    let mut host = Collector::default();
    assert_eq!(run_with(&mut ctx, &mut host), RunResult::Pass);
    assert_eq!(host.said, vec![b"loaded".to_vec()]);
}
