use std::{
    io::{BufRead, BufReader, Read, Write},
    process::{Command, Stdio},
};

use itertools::Itertools;

use crate::error::ProvisionError;

/// A host program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    /// Fed to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Build a command from a configured argv template.
    ///
    /// Every `{key}` occurrence in any argument is replaced by its value from `vars`.
    /// Only the template text is scanned, so substituted values are never expanded
    /// again. Shell expansions such as `${HOSTNAME}` and braces that do not wrap a
    /// lowercase identifier are kept as written.
    ///
    /// # Errors
    /// - the template is empty
    /// - a `{identifier}` placeholder is not in `vars`
    pub fn from_template(template: &[String], vars: &[(&str, &str)]) -> Result<Self, ProvisionError> {
        let Some((program, args)) = template.split_first() else {
            return Err(ProvisionError::Config("empty command template".to_owned()));
        };
        let expand = |s: &String| expand_placeholders(s, vars);
        Ok(Self {
            program: expand(program)?,
            args: args.iter().map(expand).collect::<Result<_, _>>()?,
            stdin: None,
        })
    }
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

fn expand_placeholders(template: &str, vars: &[(&str, &str)]) -> Result<String, ProvisionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let (before, from_brace) = rest.split_at(open);
        out.push_str(before);
        let Some(close) = from_brace.find('}') else {
            rest = from_brace;
            break;
        };
        let name = &from_brace[1..close];
        let shell_expansion = template[..template.len() - from_brace.len()].ends_with('$');
        if !is_placeholder(name) || shell_expansion {
            out.push_str(&from_brace[..=close]);
        } else if let Some((_, value)) = vars.iter().find(|(k, _)| *k == name) {
            out.push_str(value);
        } else {
            return Err(ProvisionError::Config(format!(
                "unknown placeholder {{{name}}} in command template"
            )));
        }
        rest = &from_brace[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

impl std::fmt::Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let line = std::iter::once(&self.program)
            .chain(&self.args)
            .map(|a| {
                if a.contains(char::is_whitespace) {
                    format!("'{a}'")
                } else {
                    a.clone()
                }
            })
            .join(" ");
        f.write_str(&line)
    }
}

/// What a finished command left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Exit code, `-1` when terminated by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        self.status == 0
    }

    /// Both streams, stdout first.
    #[must_use]
    pub fn combined(&self) -> String {
        [self.stdout.trim_end(), self.stderr.trim_end()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .join("\n")
    }
}

/// Read `stream` to EOF, decoding each line lossily.
///
/// Stopping early would close the pipe and kill a healthy child with `SIGPIPE`.
fn drain(stream: impl Read, prefix: &str) -> String {
    let mut reader = BufReader::new(stream);
    let mut acc = String::new();
    let mut buf = vec![];
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                tracing::debug!("{prefix} {line}");
                acc.push_str(line);
                acc.push('\n');
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(?e, "Cannot read child output");
                break;
            }
        }
    }
    acc
}

/// Run `cmd` to completion, streaming its output to the log as it arrives.
///
/// Non-zero exit is not an error here; callers decide.
pub fn pipe_cmd(cmd: &Cmd) -> std::io::Result<CmdOutput> {
    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (&cmd.stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(input.as_bytes()) {
            drop(pipe);
            // reap it, it may still be blocked on its output pipes
            if let Err(kill) = child.kill() {
                tracing::debug!(?kill, "Child already exited");
            }
            child.wait()?;
            return Err(e);
        }
    }

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(std::io::Error::other("child process has no output pipes"));
    };

    tracing::debug!("┌─ BEGIN: {cmd}");
    let (stdout, stderr) = std::thread::scope(|s| {
        let out = s.spawn(|| drain(stdout, " │"));
        let err = s.spawn(|| drain(stderr, "!│"));
        (out.join().unwrap_or_default(), err.join().unwrap_or_default())
    });
    let status = child.wait()?;
    tracing::debug!("└─ END OF {} ({status})", cmd.program);

    Ok(CmdOutput {
        status: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn template_expansion() {
        let cmd = Cmd::from_template(
            &template(&["bootctl", "--root={root}", "--esp-path={esp}", "install"]),
            &[("root", "/work/target"), ("esp", "/work/target/boot")],
        )
        .unwrap();
        assert_eq!(cmd.program, "bootctl");
        assert_eq!(
            cmd.args,
            ["--root=/work/target", "--esp-path=/work/target/boot", "install"]
        );
    }

    #[test]
    fn template_keeps_shell_braces_and_values() {
        let cmd = Cmd::from_template(
            &template(&["sh", "-c", "echo ${HOSTNAME} > {root}/etc/hostname", "{}"]),
            &[("root", "/mnt/{weird}")],
        )
        .unwrap();
        assert_eq!(cmd.args, ["-c", "echo ${HOSTNAME} > /mnt/{weird}/etc/hostname", "{}"]);

        let cmd = Cmd::from_template(&template(&["awk", "{print $1}", "{root"]), &[("root", "/")]).unwrap();
        assert_eq!(cmd.args, ["{print $1}", "{root"]);
    }

    #[test]
    fn template_rejects_unknown_placeholder() {
        let err = Cmd::from_template(&template(&["mkiso", "{staging}"]), &[("root", "/")]).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(m) if m.contains("{staging}")));
        assert!(Cmd::from_template(&[], &[]).is_err());
    }

    #[test]
    fn display_quotes_spaces() {
        let cmd = Cmd::new("mkfs.fat").args(["-n", "MY EFI"]);
        assert_eq!(cmd.to_string(), "mkfs.fat -n 'MY EFI'");
    }

    #[test]
    fn pipe_cmd_captures_streams() {
        let out = pipe_cmd(&Cmd::new("sh").args(["-c", "cat; echo oops >&2; exit 3"]).stdin("hello\n")).unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.combined(), "hello\noops");
    }

    #[test]
    fn pipe_cmd_reads_past_invalid_utf8() {
        // enough output to fill the pipe if the reader gave up on the first line
        let script = r#"printf '\377\n'; i=0; while [ $i -lt 30000 ]; do echo line$i; i=$((i+1)); done; exit 0"#;
        let out = pipe_cmd(&Cmd::new("sh").args(["-c", script])).unwrap();
        assert_eq!(out.status, 0);
        assert!(out.stdout.starts_with("\u{fffd}\nline0\n"));
        assert!(out.stdout.ends_with("line29999\n"));
    }
}
