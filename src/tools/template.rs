//! Argument and working-directory templating.
//!
//! Placeholders are written `$name`. For `sh -c <script>` style commands the
//! script is searched for `$name` at a word boundary; for every other command
//! an argv element is replaced only when it is exactly `$name`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Error, Result};

/// Well-known local directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirs {
    pub home: String,
    pub temp: String,
}

impl Dirs {
    /// Current user's home directory (empty when unknown) and the system temp directory.
    pub fn detect() -> Self {
        let home = dirs::home_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = std::env::temp_dir().to_string_lossy().into_owned();
        Self { home, temp }
    }
}

/// True for `[<…sh>, "-c", script]`.
fn is_shell_script(cmd: &[String]) -> bool {
    cmd.len() == 3 && cmd[0].ends_with("sh") && cmd[1] == "-c"
}

/// Substitute invocation arguments into an argument template.
pub fn render_command(cmd: &[String], args: &HashMap<String, String>) -> Result<Vec<String>> {
    if cmd.is_empty() {
        return Err(Error::configuration("command is empty"));
    }
    let mut rendered = cmd.to_vec();

    if is_shell_script(cmd) {
        let mut names: Vec<&str> = args
            .keys()
            .map(String::as_str)
            .filter(|k| !k.is_empty())
            .collect();
        if !names.is_empty() {
            // One pass over the script: substituted values are never rescanned.
            names.sort_unstable_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
            let alternation = names
                .iter()
                .map(|name| regex::escape(name))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = Regex::new(&format!(r"\$({})\b", alternation))
                .map_err(|e| Error::validation(format!("invalid argument names: {}", e)))?;
            let script = pattern
                .replace_all(&cmd[2], |caps: &regex::Captures<'_>| {
                    args.get(&caps[1]).cloned().unwrap_or_default()
                })
                .into_owned();
            rendered[2] = script;
        }
    } else {
        for arg in rendered.iter_mut() {
            if let Some(value) = arg.strip_prefix('$').and_then(|name| args.get(name)) {
                *arg = value.clone();
            }
        }
    }
    Ok(rendered)
}

/// Expand `~`, `$HOME`, `$TEMP` and `$TMPDIR` in a working directory.
pub fn render_working_dir(raw: &str, dirs: &Dirs) -> String {
    let expanded = if raw == "~" {
        dirs.home.clone()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        format!("{}/{}", dirs.home.trim_end_matches('/'), rest)
    } else {
        raw.to_string()
    };
    expanded
        .replace("$HOME", &dirs.home)
        .replace("$TMPDIR", dirs.temp.trim_end_matches('/'))
        .replace("$TEMP", dirs.temp.trim_end_matches('/'))
}
