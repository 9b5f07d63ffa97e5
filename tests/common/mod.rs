//! A scripted stand-in for the engine.
//!
//! The script parses `--status-fd` and `--command-fd` like the real engine
//! and then runs a test-supplied body, which can use:
//!
//! - `status KEYWORD ARGS...` to emit a status line,
//! - `ask KEYWORD ARGS...` to emit a query and read the answer into `$ANSWER`.
//!
//! Standard input and output are the operation's data streams, so `cat`
//! copies the input to the output.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use pgme::Context;
use tempfile::TempDir;

const PRELUDE: &str = r#"#!/bin/sh
printf '%s\n' "$@" > "$(dirname "$0")/argv"
STATUS=2
COMMAND=
while [ $# -gt 0 ]; do
    case "$1" in
        --status-fd) STATUS=$2; shift ;;
        --command-fd) COMMAND=$2; shift ;;
    esac
    shift
done
status() {
    echo "[GNUPG:] $*" >&$STATUS
}
ask() {
    status "$@"
    read -r ANSWER <&$COMMAND
}
"#;

static SERIAL: Mutex<()> = Mutex::new(());

/// Serializes tests that spawn engines. A script being written while another
/// test forks can otherwise fail to execute with `ETXTBSY`.
pub fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct MockEngine {
    dir: TempDir,
    path: PathBuf,
}

impl MockEngine {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mock-gpg");
        fs::write(&path, format!("{}{}\n", PRELUDE, body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        MockEngine { dir, path }
    }

    /// A context that runs this engine.
    pub fn context(&self) -> Context {
        let ctx = Context::new().unwrap();
        ctx.set_engine_info(Some(&self.path), None);
        ctx
    }

    /// The arguments of the most recent run.
    pub fn argv(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("argv"))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }
}

/// A decryption that succeeds and copies its input.
pub const DECRYPT_OK: &str = r#"
status ENC_TO 1111222233334444 18 0
status DECRYPTION_INFO 2 9
status PLAINTEXT 62 1700000000 note.txt
status DECRYPTION_OKAY
cat
"#;

/// A key listing of two keys.
pub const TWO_KEYS: &str = r#"
cat <<'EOF'
pub:u:255:22:1111222233334444:1700000000:1800000000::u:::scESC::::ed25519:::0:
fpr:::::::::AAAABBBBCCCCDDDDEEEEFFFF1111222233334444:
uid:u::::1700000000::HASH::Alice <alice@example.org>::::::::::0:
pub:f:255:22:5555666677778888:1700000000:::u:::sc::::::::0:
fpr:::::::::99998888777766665555444433332222:
EOF
"#;
