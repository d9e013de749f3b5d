//! Subprocess execution of manifest actions.
//!
//! Each invocation gets a fresh child process with a cleared environment
//! (only `PATH`, `HOME` and the action's manifest `env` are set), so nothing
//! from the server or a previous run leaks in.
//!
//! # Protocol
//! - stdin:  one JSON document `{"action", "inputs", "secrets", "context"}`,
//!   then EOF.
//! - stdout: the action's result as JSON (empty stdout means `null`).
//! - exit code 0 is success; anything else is an action error carrying the
//!   tail of stderr.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::action::{ActionInvoker, ActionSignature, CancelToken, InvokeFailure};
use crate::injector::BoundParameters;
use crate::manifest::Manifest;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const STDERR_TAIL: usize = 500;

/// Runs manifest actions as isolated child processes.
pub struct ProcessInvoker {
    manifest: Arc<Manifest>,
}

impl ProcessInvoker {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self { manifest }
    }
}

#[derive(Serialize)]
struct StdinDocument<'a> {
    action: &'a str,
    inputs: &'a serde_json::Map<String, serde_json::Value>,
    secrets: BTreeMap<&'a str, &'a str>,
    context: &'a BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

/// Sizes the stdin buffer up front. A reallocation would leave an unwiped
/// copy of the secrets in freed memory.
struct ByteCount(usize);

impl Write for ByteCount {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Serialize the stdin document. The buffer is zeroized when dropped.
fn stdin_document(
    signature: &ActionSignature,
    params: &BoundParameters,
) -> serde_json::Result<Zeroizing<Vec<u8>>> {
    let doc = StdinDocument {
        action: &signature.id,
        inputs: &params.values,
        secrets: params
            .secrets
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose()))
            .collect(),
        context: &params.context,
    };
    let mut count = ByteCount(0);
    serde_json::to_writer(&mut count, &doc)?;
    let mut buf = Zeroizing::new(Vec::with_capacity(count.0));
    serde_json::to_writer(&mut *buf, &doc)?;
    Ok(buf)
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

impl ActionInvoker for ProcessInvoker {
    fn invoke(
        &self,
        signature: &ActionSignature,
        params: &BoundParameters,
        cancel: &CancelToken,
    ) -> std::result::Result<serde_json::Value, InvokeFailure> {
        let action = self
            .manifest
            .action(&signature.id)
            .ok_or_else(|| InvokeFailure::Error(format!("action '{}' not in manifest", signature.id)))?;
        let program = self
            .manifest
            .program_path(action)
            .map_err(|e| InvokeFailure::Error(e.to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(&action.command[1..])
            .current_dir(&self.manifest.base_dir)
            .env_clear();
        for var in ["PATH", "HOME"] {
            if let Some(value) = std::env::var_os(var) {
                cmd.env(var, value);
            }
        }
        cmd.envs(&action.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let doc = stdin_document(signature, params)
            .map_err(|e| InvokeFailure::Error(format!("failed to encode action input: {e}")))?;
        let mut child = cmd
            .spawn()
            .map_err(|e| InvokeFailure::Error(format!("failed to spawn action: {e}")))?;
        tracing::debug!(action = %signature.id, pid = child.id(), "action process started");

        // Drain both pipes on their own threads so a chatty child never blocks.
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(ref mut s) = stdout {
                let _ = s.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(ref mut s) = stderr {
                let _ = s.read_to_end(&mut buf);
            }
            buf
        });

        // The write blocks while the child leaves stdin unread, so it must not
        // hold up the cancel loop below. The thread owns the buffer and wipes it.
        let stdin = child.stdin.take();
        let stdin_writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading stdin closes the pipe; that
                // is reported through its exit status, not here.
                let _ = stdin.write_all(&doc);
            }
        });

        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                tracing::info!(action = %signature.id, "action process killed on cancel");
                return Err(InvokeFailure::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(InvokeFailure::Error(format!("wait failed: {e}"))),
            }
        };

        let _ = stdin_writer.join();
        let out = stdout_reader.join().unwrap_or_default();
        let err = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            let stderr_text = String::from_utf8_lossy(&err);
            return Err(InvokeFailure::Error(format!(
                "action exited with {code}: {}",
                tail(&stderr_text)
            )));
        }

        if out.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&out)
            .map_err(|e| InvokeFailure::Error(format!("action returned invalid JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::context::SecretValue;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn invoker(yaml: &str, dir: PathBuf) -> (ProcessInvoker, Arc<Manifest>) {
        let manifest = Arc::new(Manifest::from_yaml(yaml, dir).unwrap());
        (ProcessInvoker::new(manifest.clone()), manifest)
    }

    fn params_with_secret(name: &str, value: &str) -> BoundParameters {
        let mut params = BoundParameters::default();
        params
            .values
            .insert("who".into(), serde_json::json!("world"));
        params
            .secrets
            .insert(name.into(), SecretValue::new(value));
        params
    }

    #[test]
    fn echoes_stdin_document_back() {
        let dir = TempDir::new().unwrap();
        let (inv, manifest) = invoker(
            "actions:\n  - {id: echo, command: [sh, -c, cat]}\n",
            dir.path().to_path_buf(),
        );
        let sig = manifest.resolve("echo").unwrap();
        let out = inv
            .invoke(&sig, &params_with_secret("token", "abc"), &CancelToken::new())
            .unwrap();
        assert_eq!(out["action"], "echo");
        assert_eq!(out["inputs"]["who"], "world");
        assert_eq!(out["secrets"]["token"], "abc");
    }

    #[test]
    fn environment_is_cleared_except_manifest_env() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("ACTION_SERVER_RUNNER_TEST_LEAK", "leaked");
        let (inv, manifest) = invoker(
            r#"
actions:
  - id: env
    command: [sh, -c, 'printf "[\"%s\",\"%s\"]" "$ACTION_SERVER_RUNNER_TEST_LEAK" "$GREETING"']
    env: {GREETING: hi}
"#,
            dir.path().to_path_buf(),
        );
        let sig = manifest.resolve("env").unwrap();
        let out = inv
            .invoke(&sig, &BoundParameters::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(out, serde_json::json!(["", "hi"]));
    }

    #[test]
    fn non_zero_exit_reports_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let (inv, manifest) = invoker(
            "actions:\n  - {id: boom, command: [sh, -c, 'echo kaput >&2; exit 3']}\n",
            dir.path().to_path_buf(),
        );
        let sig = manifest.resolve("boom").unwrap();
        let err = inv
            .invoke(&sig, &BoundParameters::default(), &CancelToken::new())
            .unwrap_err();
        match err {
            InvokeFailure::Error(msg) => {
                assert!(msg.contains("exited with 3"), "{msg}");
                assert!(msg.contains("kaput"), "{msg}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn empty_stdout_is_null() {
        let dir = TempDir::new().unwrap();
        let (inv, manifest) = invoker(
            "actions:\n  - {id: quiet, command: [sh, -c, 'cat >/dev/null']}\n",
            dir.path().to_path_buf(),
        );
        let sig = manifest.resolve("quiet").unwrap();
        let out = inv
            .invoke(&sig, &BoundParameters::default(), &CancelToken::new())
            .unwrap();
        assert!(out.is_null());
    }

    #[test]
    fn cancel_kills_the_child() {
        let dir = TempDir::new().unwrap();
        let (inv, manifest) = invoker(
            "actions:\n  - {id: slow, command: [sh, -c, 'sleep 30']}\n",
            dir.path().to_path_buf(),
        );
        let sig = manifest.resolve("slow").unwrap();
        let token = CancelToken::new();
        let trigger = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = inv
            .invoke(&sig, &BoundParameters::default(), &token)
            .unwrap_err();
        assert_eq!(err, InvokeFailure::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancel_is_honoured_while_stdin_is_unread() {
        let dir = TempDir::new().unwrap();
        let (inv, manifest) = invoker(
            "actions:\n  - {id: deaf, command: [sh, -c, 'sleep 30']}\n",
            dir.path().to_path_buf(),
        );
        let sig = manifest.resolve("deaf").unwrap();
        // Far larger than a pipe buffer.
        let mut params = BoundParameters::default();
        params
            .values
            .insert("blob".into(), serde_json::json!("x".repeat(256 * 1024)));
        let token = CancelToken::new();
        let trigger = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = inv.invoke(&sig, &params, &token).unwrap_err();
        assert_eq!(err, InvokeFailure::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn stdin_document_carries_secrets_and_context() {
        let mut params = params_with_secret("token", "abc");
        let mut ctx = serde_json::Map::new();
        ctx.insert("tenant".into(), serde_json::json!("acme"));
        params.context.insert("ctx".into(), ctx);
        let sig = ActionSignature {
            id: "doc".into(),
            description: String::new(),
            parameters: Vec::new(),
        };
        let buf = stdin_document(&sig, &params).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({
                "action": "doc",
                "inputs": {"who": "world"},
                "secrets": {"token": "abc"},
                "context": {"ctx": {"tenant": "acme"}},
            })
        );
    }

    #[test]
    fn tail_keeps_last_characters() {
        let long = "x".repeat(600) + "END";
        let t = tail(&long);
        assert_eq!(t.chars().count(), STDERR_TAIL);
        assert!(t.ends_with("END"));
        assert_eq!(tail("short"), "short");
    }
}
