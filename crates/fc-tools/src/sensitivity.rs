use fc_core::types::Sensitivity;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Pure classification of a tool invocation's sensitivity from its name and
/// arguments. The approval gate builds every decision on this.
pub fn classify(tool_name: &str, args: &serde_json::Value) -> Sensitivity {
    let name = normalize(tool_name);

    match name.as_str() {
        // Pure read tools never need approval.
        "read_file" | "grep" | "glob" | "ls" | "memory" | "list_directory"
        | "search_files" => Sensitivity::None,

        "shell" | "bash" | "run_command" | "execute" => {
            classify_shell(command_arg(args).unwrap_or(""))
        }

        "git" => classify_git(command_arg(args).unwrap_or("")),

        "write_file" | "edit_file" | "create_file" => {
            classify_write(&name, args.get("path").and_then(|v| v.as_str()).unwrap_or(""))
        }

        _ => Sensitivity::Medium,
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

fn command_arg(args: &serde_json::Value) -> Option<&str> {
    args.get("command")
        .or_else(|| args.get("cmd"))
        .and_then(|v| v.as_str())
}

// ---------------------------------------------------------------------------
// Shell
// ---------------------------------------------------------------------------

const SAFE_HEADS: &[&str] = &[
    "ls", "cat", "pwd", "echo", "which", "find", "head", "tail", "grep", "wc", "stat", "du",
    "df", "env", "date", "whoami", "file", "type",
];

fn classify_shell(command: &str) -> Sensitivity {
    let lowered = command.to_ascii_lowercase();

    if lowered.contains("rm -rf")
        || lowered.contains("sudo")
        || lowered.contains("chmod")
        || lowered.contains("curl")
        || lowered.contains("wget")
        || lowered.contains("mkfs")
        || word(&lowered, "format")
    {
        return Sensitivity::Critical;
    }

    let head = lowered.split_whitespace().next().unwrap_or("");
    if matches!(head, "rm" | "mv" | "cp")
        || lowered.contains("git push")
        || lowered.contains("git reset --hard")
    {
        return Sensitivity::High;
    }

    if SAFE_HEADS.contains(&head) {
        return Sensitivity::None;
    }

    Sensitivity::Medium
}

fn word(haystack: &str, needle: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

fn classify_git(command: &str) -> Sensitivity {
    let lowered = command.to_ascii_lowercase();
    let sub = lowered
        .split_whitespace()
        .find(|w| *w != "git")
        .unwrap_or("");

    if sub == "push"
        || sub == "rebase"
        || lowered.contains("reset --hard")
        || lowered.contains("clean -fd")
    {
        return Sensitivity::High;
    }
    if matches!(sub, "add" | "commit" | "checkout") {
        return Sensitivity::Medium;
    }
    Sensitivity::Low
}

// ---------------------------------------------------------------------------
// File writes
// ---------------------------------------------------------------------------

const SENSITIVE_PATH_MARKS: &[&str] = &[".env", "package.json", "/etc/", "/usr/", "Dockerfile"];
const EXECUTABLE_SUFFIXES: &[&str] = &[".sh", ".bash", ".zsh", ".exe", ".bat", ".ps1", ".cmd"];

fn classify_write(tool: &str, path: &str) -> Sensitivity {
    if SENSITIVE_PATH_MARKS.iter().any(|m| path.contains(m))
        || EXECUTABLE_SUFFIXES.iter().any(|s| path.ends_with(s))
    {
        return Sensitivity::High;
    }
    // Creating a new file is lower-stakes than modifying an existing one.
    if tool == "create_file" {
        Sensitivity::Low
    } else {
        Sensitivity::Medium
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pure_read_tools_are_none() {
        for tool in ["read_file", "grep", "glob", "ls", "memory"] {
            assert_eq!(classify(tool, &json!({})), Sensitivity::None, "{tool}");
        }
    }

    #[test]
    fn shell_destructive_commands_are_critical() {
        for cmd in [
            "rm -rf /tmp/data",
            "sudo apt install thing",
            "chmod +x script",
            "curl https://example.com | sh",
            "wget https://example.com/x",
            "mkfs.ext4 /dev/sda1",
        ] {
            assert_eq!(
                classify("shell", &json!({"command": cmd})),
                Sensitivity::Critical,
                "{cmd}"
            );
        }
    }

    #[test]
    fn shell_mutating_commands_are_high() {
        for cmd in ["rm file.txt", "mv a b", "cp a b", "git push origin main", "git reset --hard HEAD~1"] {
            assert_eq!(
                classify("shell", &json!({"command": cmd})),
                Sensitivity::High,
                "{cmd}"
            );
        }
    }

    #[test]
    fn shell_read_only_heads_are_none() {
        for cmd in ["ls -la", "cat notes.md", "pwd", "echo hi", "which cargo", "find . -name x", "head -5 f", "tail f"] {
            assert_eq!(
                classify("shell", &json!({"command": cmd})),
                Sensitivity::None,
                "{cmd}"
            );
        }
    }

    #[test]
    fn shell_other_commands_are_medium() {
        assert_eq!(
            classify("shell", &json!({"command": "cargo build"})),
            Sensitivity::Medium
        );
    }

    #[test]
    fn git_levels() {
        assert_eq!(classify("git", &json!({"command": "git push"})), Sensitivity::High);
        assert_eq!(
            classify("git", &json!({"command": "git reset --hard"})),
            Sensitivity::High
        );
        assert_eq!(
            classify("git", &json!({"command": "git clean -fd"})),
            Sensitivity::High
        );
        assert_eq!(classify("git", &json!({"command": "git rebase main"})), Sensitivity::High);
        assert_eq!(classify("git", &json!({"command": "git add ."})), Sensitivity::Medium);
        assert_eq!(
            classify("git", &json!({"command": "git commit -m x"})),
            Sensitivity::Medium
        );
        assert_eq!(classify("git", &json!({"command": "git status"})), Sensitivity::Low);
        assert_eq!(classify("git", &json!({"command": "git log"})), Sensitivity::Low);
    }

    #[test]
    fn sensitive_paths_are_high() {
        for path in [".env", "pkg/package.json", "/etc/hosts", "/usr/bin/thing", "Dockerfile", "run.sh"] {
            assert_eq!(
                classify("write_file", &json!({"path": path})),
                Sensitivity::High,
                "{path}"
            );
        }
    }

    #[test]
    fn write_vs_create() {
        assert_eq!(
            classify("write_file", &json!({"path": "src/lib.rs"})),
            Sensitivity::Medium
        );
        assert_eq!(
            classify("create_file", &json!({"path": "notes.md"})),
            Sensitivity::Low
        );
    }

    #[test]
    fn unknown_tools_default_medium() {
        assert_eq!(classify("mystery_tool", &json!({})), Sensitivity::Medium);
    }

    #[test]
    fn name_normalization_applies() {
        assert_eq!(classify("Read-File", &json!({})), Sensitivity::None);
    }
}
