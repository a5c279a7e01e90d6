//! System clipboard through the platform's clipboard programs
//!
//! Only the fixed set of tools below can ever be invoked, each with fixed
//! arguments. Values go in over stdin and come back over stdout; they are
//! never placed on a command line.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;
use zeroize::Zeroizing;

use crate::slot::{ResourceError, SharedResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardTool {
    /// wl-copy / wl-paste (Wayland)
    WlClipboard,
    /// xclip (X11)
    Xclip,
    /// xsel (X11)
    Xsel,
    /// pbcopy / pbpaste (macOS)
    Pasteboard,
}

impl ClipboardTool {
    fn copy_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ClipboardTool::WlClipboard => ("wl-copy", &[]),
            ClipboardTool::Xclip => ("xclip", &["-selection", "clipboard", "-in"]),
            ClipboardTool::Xsel => ("xsel", &["--clipboard", "--input"]),
            ClipboardTool::Pasteboard => ("pbcopy", &[]),
        }
    }

    fn paste_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ClipboardTool::WlClipboard => ("wl-paste", &["--no-newline"]),
            ClipboardTool::Xclip => ("xclip", &["-selection", "clipboard", "-out"]),
            ClipboardTool::Xsel => ("xsel", &["--clipboard", "--output"]),
            ClipboardTool::Pasteboard => ("pbpaste", &[]),
        }
    }

    /// Dedicated clear primitive, where the tool has one. The others are
    /// cleared by writing an empty selection.
    fn clear_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            ClipboardTool::WlClipboard => Some(("wl-copy", &["--clear"])),
            ClipboardTool::Xsel => Some(("xsel", &["--clipboard", "--clear"])),
            ClipboardTool::Xclip | ClipboardTool::Pasteboard => None,
        }
    }

    fn programs(&self) -> Vec<&'static str> {
        let mut programs = vec![self.copy_command().0, self.paste_command().0];
        programs.dedup();
        programs
    }
}

/// Pick a tool for the current session.
///
/// `env` looks up environment variables, `installed` checks whether a
/// program is on PATH.
pub fn detect_tool(env: impl Fn(&str) -> Option<String>, installed: impl Fn(&str) -> bool) -> Option<ClipboardTool> {
    let mut candidates = Vec::new();
    if cfg!(target_os = "macos") {
        candidates.push(ClipboardTool::Pasteboard);
    }
    if env("WAYLAND_DISPLAY").is_some() {
        candidates.push(ClipboardTool::WlClipboard);
    }
    if env("DISPLAY").is_some() {
        candidates.push(ClipboardTool::Xclip);
        candidates.push(ClipboardTool::Xsel);
    }

    candidates
        .into_iter()
        .find(|tool| tool.programs().iter().all(|p| installed(p)))
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_file(&dir.join(program))))
        .unwrap_or(false)
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

pub struct SystemClipboard {
    tool: ClipboardTool,
}

impl SystemClipboard {
    pub fn new(tool: ClipboardTool) -> Self {
        Self { tool }
    }

    pub fn detect() -> Result<Self, ResourceError> {
        detect_tool(|name| std::env::var(name).ok(), on_path)
            .map(Self::new)
            .ok_or_else(|| ResourceError::Unavailable("no supported clipboard tool found".to_string()))
    }

    pub fn tool(&self) -> ClipboardTool {
        self.tool
    }

    fn pipe_in(&self, (program, args): (&str, &[&str]), input: &[u8]) -> Result<(), ResourceError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input)?;
        }

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(ResourceError::Unavailable(format!("{} exited with {}", program, status)))
        }
    }
}

/// Paste output as clipboard contents. wl-paste and xclip exit non-zero
/// when nothing is selected. Bytes pass through untouched, so binary or
/// non-UTF-8 contents never compare equal to an exposed string.
fn pasted(success: bool, raw: Zeroizing<Vec<u8>>) -> Option<Zeroizing<Vec<u8>>> {
    (success && !raw.is_empty()).then_some(raw)
}

impl SharedResource for SystemClipboard {
    fn write(&self, value: &str, sensitive: bool) -> Result<(), ResourceError> {
        if sensitive {
            debug!(tool = ?self.tool, "Clipboard tool has no sensitivity hint; writing plain text");
        }
        self.pipe_in(self.tool.copy_command(), value.as_bytes())
    }

    fn read_current(&self) -> Result<Option<Zeroizing<Vec<u8>>>, ResourceError> {
        let (program, args) = self.tool.paste_command();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut raw = Zeroizing::new(Vec::new());
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_end(&mut raw)?;
        }

        Ok(pasted(child.wait()?.success(), raw))
    }

    fn clear(&self) -> Result<(), ResourceError> {
        match self.tool.clear_command() {
            Some((program, args)) => {
                let status = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()?;
                if status.success() {
                    Ok(())
                } else {
                    Err(ResourceError::Unavailable(format!("{} exited with {}", program, status)))
                }
            }
            None => self.pipe_in(self.tool.copy_command(), b""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(vars: &'static [&'static str]) -> impl Fn(&str) -> Option<String> {
        move |name: &str| vars.contains(&name).then(|| "1".to_string())
    }

    #[test]
    fn test_wayland_preferred_when_installed() {
        let tool = detect_tool(env_with(&["WAYLAND_DISPLAY", "DISPLAY"]), |_| true);
        if cfg!(target_os = "macos") {
            assert_eq!(tool, Some(ClipboardTool::Pasteboard));
        } else {
            assert_eq!(tool, Some(ClipboardTool::WlClipboard));
        }
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_falls_back_to_xsel_without_xclip() {
        let tool = detect_tool(env_with(&["DISPLAY"]), |p| p == "xsel");
        assert_eq!(tool, Some(ClipboardTool::Xsel));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_no_display_no_tool() {
        assert_eq!(detect_tool(env_with(&[]), |_| true), None);
    }

    #[test]
    fn test_wayland_needs_both_halves() {
        let tool = detect_tool(env_with(&["WAYLAND_DISPLAY"]), |p| p == "wl-copy");
        if !cfg!(target_os = "macos") {
            assert_eq!(tool, None);
        }
    }

    #[test]
    fn test_clear_primitives() {
        assert_eq!(
            ClipboardTool::WlClipboard.clear_command(),
            Some(("wl-copy", &["--clear"][..]))
        );
        assert!(ClipboardTool::Xclip.clear_command().is_none());
        assert_eq!(ClipboardTool::Xclip.programs(), vec!["xclip"]);
    }

    #[test]
    fn test_pasted_keeps_raw_bytes() {
        let binary = pasted(true, Zeroizing::new(vec![0xff, b'a', 0xfe])).unwrap();
        assert_eq!(binary.as_slice(), &[0xff, b'a', 0xfe]);

        assert!(pasted(true, Zeroizing::new(Vec::new())).is_none());
        assert!(pasted(false, Zeroizing::new(b"stale".to_vec())).is_none());
    }
}
