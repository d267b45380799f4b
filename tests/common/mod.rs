use assert_cmd::{Command, cargo::cargo_bin_cmd};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;

/// Stand-in for the recovery engine. `create` writes a manifest of
/// checksums instead of recovery data; `list` and `verify` read it back and
/// answer in the engine's report formats.
const FAKE_ENGINE: &str = r#"#!/bin/sh
verb=$1
shift 2
if [ -n "$PARTREE_FAKE_LOG" ]; then
    echo "$verb $*" >> "$PARTREE_FAKE_LOG"
fi

case "$verb" in
create)
    archive=$2
    dir=${3%/\*}
    printf 'Opening files\r\n'
    printf '  0.0%%\r 50.0%%\r100.0%%\r\n'
    code=${PARTREE_FAKE_CREATE_EXIT:-0}
    if [ "$code" != 0 ]; then
        exit "$code"
    fi
    (cd "$dir" && find . -name .partree -prune -o -type f -print | sed 's|^\./||' | sort |
        while IFS= read -r f; do cksum "$f"; done) > "$archive"
    printf 'Created successfully\r\n'
    ;;
list)
    archive=$1
    printf 'Parchive 2.0 client\r\n\r\n  Size  Slice  MD5 Hash  :  Filename\r\n'
    while read -r sum size name; do
        printf '  %s  1  00ff  : "%s"\r\n' "$size" "$name"
    done < "$archive"
    printf '\r\nListed\r\n'
    ;;
verify)
    dir=${1#/d}
    archive=$2
    printf 'Loading recovery packets\r\n\r\n  Size  Status  :  Filename\r\n'
    code=0
    while read -r sum size name; do
        if [ ! -f "$dir/$name" ]; then
            state=Missing
            code=1
        elif [ "$(cd "$dir" && cksum "$name")" != "$sum $size $name" ]; then
            state=Damaged
            code=1
        else
            state=Complete
        fi
        printf ' 50%%\r'
        printf '  %s  %s  : "%s"\r\n' "$size" "$state" "$name"
    done < "$archive"
    exit $code
    ;;
repair)
    printf 'Repairing\r\n'
    exit "${PARTREE_FAKE_REPAIR_EXIT:-0}"
    ;;
*)
    exit 2
    ;;
esac
"#;

/// A working directory, a fake engine and a settings file, all in one
/// temporary directory.
pub struct Fixture {
    _temp: TempDir,
    pub work: PathBuf,
    pub engine: PathBuf,
    pub config: PathBuf,
    log: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let base = temp.path().canonicalize().unwrap();

        let work = base.join("work");
        fs::create_dir(&work).unwrap();

        let engine = base.join("fake-par2");
        fs::write(&engine, FAKE_ENGINE).unwrap();
        fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();

        Fixture {
            _temp: temp,
            work,
            engine,
            config: base.join("partree.toml"),
            log: base.join("engine.log"),
        }
    }

    /// A fixture with `photos/a.jpg` and `photos/sub/b.jpg`.
    pub fn with_photos() -> Self {
        let fixture = Self::new();
        fixture.write("photos/a.jpg", "first photo");
        fixture.write("photos/sub/b.jpg", "second photo");
        fixture
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.work.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> PathBuf {
        self.work.join(".partree")
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("partree");
        cmd.env_remove("RUST_LOG")
            .env("PARTREE_FAKE_LOG", &self.log)
            .arg("-C")
            .arg(&self.work)
            .arg("--engine")
            .arg(&self.engine)
            .arg("--config")
            .arg(&self.config);
        cmd
    }

    #[allow(dead_code)]
    pub fn run_ok(&self, args: &[&str]) {
        self.cmd().args(args).assert().success();
    }

    /// Engine invocations so far, one line each: verb followed by its
    /// arguments after `/uo`.
    #[allow(dead_code)]
    pub fn engine_calls(&self) -> Vec<String> {
        match fs::read_to_string(&self.log) {
            Ok(log) => log.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }
}

// Not every test crate inspects the engine's argument list.
#[allow(dead_code)]
pub fn calls_of<'a>(calls: &'a [String], verb: &str) -> Vec<&'a str> {
    let prefix = format!("{verb} ");
    calls
        .iter()
        .filter(|c| c.starts_with(&prefix))
        .map(String::as_str)
        .collect()
}
