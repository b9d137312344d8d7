//! Pane handle: a detached tmux session running the agent program.

use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use tokio::sync::oneshot;

const SESSION_PREFIX: &str = "corral_";

/// Pane content markers that look like a confirmation prompt waiting for the
/// user. Used by the auto-yes keystroke injection.
const CONFIRMATION_PROMPTS: &[&str] = &[
    "Do you trust the files in this folder?",
    "Do you want to proceed?",
    "[y/n]",
    "(y/n)",
    "(y/N)",
    "[Y/n]",
];

/// Runs tmux commands. Injectable so tests can drive the session logic
/// without a tmux server.
pub trait TmuxExecutor: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<()>;
    fn output(&self, args: &[&str]) -> Result<String>;
}

/// Shells out to the real tmux binary.
pub struct SystemTmuxExecutor;

impl TmuxExecutor for SystemTmuxExecutor {
    fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .context("failed to run tmux")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(())
    }

    fn output(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .context("failed to run tmux")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// A detached tmux session owned by one instance.
pub struct TmuxSession {
    session_name: String,
    program: String,
    executor: Arc<dyn TmuxExecutor>,
    /// Last captured pane content, for change detection.
    last_capture: Mutex<String>,
}

/// Map a session title onto a name tmux accepts.
fn tmux_session_name(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{SESSION_PREFIX}{sanitized}")
}

impl TmuxSession {
    pub fn new(title: &str, program: &str) -> Self {
        Self::with_executor(title, program, Arc::new(SystemTmuxExecutor))
    }

    /// Construct with an injected executor (test seam).
    pub fn with_executor(title: &str, program: &str, executor: Arc<dyn TmuxExecutor>) -> Self {
        Self {
            session_name: tmux_session_name(title),
            program: program.to_string(),
            executor,
            last_capture: Mutex::new(String::new()),
        }
    }

    /// Create and run the detached session in `cwd`.
    pub fn start(&self, cwd: &str) -> Result<()> {
        self.executor.run(&[
            "new-session",
            "-d",
            "-s",
            &self.session_name,
            "-c",
            cwd,
            &self.program,
        ])
    }

    /// Reconnect to an existing session.
    pub fn restore(&self) -> Result<()> {
        if !self.does_session_exist() {
            bail!("tmux session '{}' not found", self.session_name);
        }
        Ok(())
    }

    pub fn does_session_exist(&self) -> bool {
        self.executor
            .run(&["has-session", "-t", &self.session_name])
            .is_ok()
    }

    /// Terminate the session.
    pub fn close(&self) -> Result<()> {
        self.executor
            .run(&["kill-session", "-t", &self.session_name])
    }

    /// Leave the session running but release any attached client.
    pub fn detach_safely(&self) -> Result<()> {
        self.executor
            .run(&["detach-client", "-s", &self.session_name])
    }

    pub fn capture_pane_content(&self) -> Result<String> {
        self.executor
            .output(&["capture-pane", "-p", "-t", &self.session_name])
    }

    /// Capture with explicit scrollback bounds (`"-"` means the full
    /// history in either direction).
    pub fn capture_pane_content_with_options(&self, start: &str, end: &str) -> Result<String> {
        self.executor.output(&[
            "capture-pane",
            "-p",
            "-S",
            start,
            "-E",
            end,
            "-t",
            &self.session_name,
        ])
    }

    /// Whether the pane content changed since the last probe, and whether it
    /// currently shows a confirmation prompt.
    pub fn has_updated(&self) -> (bool, bool) {
        let content = match self.capture_pane_content() {
            Ok(content) => content,
            Err(_) => return (false, false),
        };
        let has_prompt = detect_confirmation_prompt(&content);
        let mut last = self.last_capture.lock().unwrap();
        let changed = *last != content;
        if changed {
            *last = content;
        }
        (changed, has_prompt)
    }

    pub fn send_keys(&self, keys: &str) -> Result<()> {
        self.executor
            .run(&["send-keys", "-t", &self.session_name, keys])
    }

    pub fn tap_enter(&self) -> Result<()> {
        self.executor
            .run(&["send-keys", "-t", &self.session_name, "Enter"])
    }

    pub fn set_detached_size(&self, width: u16, height: u16) -> Result<()> {
        let width = width.to_string();
        let height = height.to_string();
        self.executor.run(&[
            "resize-window",
            "-t",
            &self.session_name,
            "-x",
            &width,
            "-y",
            &height,
        ])
    }

    /// Attach the current terminal to the session. Resolves the returned
    /// channel when the attached client exits.
    pub async fn attach(&self) -> Result<oneshot::Receiver<()>> {
        let mut child = tokio::process::Command::new("tmux")
            .args(["attach-session", "-t", &self.session_name])
            .spawn()
            .context("failed to attach to tmux session")?;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = tx.send(());
        });
        Ok(rx)
    }
}

fn detect_confirmation_prompt(content: &str) -> bool {
    CONFIRMATION_PROMPTS
        .iter()
        .any(|prompt| content.contains(prompt))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use anyhow::Result;

    use super::{TmuxExecutor, TmuxSession, detect_confirmation_prompt, tmux_session_name};

    struct ScriptedExecutor {
        captures: Mutex<VecDeque<String>>,
    }

    impl ScriptedExecutor {
        fn new(captures: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                captures: Mutex::new(captures.iter().map(|c| c.to_string()).collect()),
            })
        }
    }

    impl TmuxExecutor for ScriptedExecutor {
        fn run(&self, _args: &[&str]) -> Result<()> {
            Ok(())
        }

        fn output(&self, _args: &[&str]) -> Result<String> {
            let mut captures = self.captures.lock().unwrap();
            Ok(captures.pop_front().unwrap_or_default())
        }
    }

    #[test]
    fn session_names_are_sanitized() {
        assert_eq!(tmux_session_name("my task"), "corral_my_task");
        assert_eq!(tmux_session_name("fix:v1.2"), "corral_fix_v1_2");
    }

    #[test]
    fn detects_confirmation_prompts() {
        assert!(detect_confirmation_prompt(
            "Do you trust the files in this folder?"
        ));
        assert!(detect_confirmation_prompt("Continue? [y/n]"));
        assert!(!detect_confirmation_prompt("compiling corral v0.1.0"));
    }

    #[test]
    fn has_updated_tracks_content_changes() {
        let executor = ScriptedExecutor::new(&["first", "first", "second [y/n]"]);
        let session = TmuxSession::with_executor("probe", "claude", executor);

        let (changed, has_prompt) = session.has_updated();
        assert!(changed, "first capture should register as a change");
        assert!(!has_prompt);

        let (changed, _) = session.has_updated();
        assert!(!changed, "identical capture should not register");

        let (changed, has_prompt) = session.has_updated();
        assert!(changed);
        assert!(has_prompt, "prompt marker should be detected");
    }
}
