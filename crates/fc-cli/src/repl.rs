use std::io::Write;

use tracing::warn;

use fc_core::abort::AbortHandle;
use fc_core::types::{ApprovalMode, Mode};

use crate::runtime::{Completion, Runtime};

/// Interactive REPL: free-form prompts run turns; slash commands manage the
/// session. Ctrl-C during a turn aborts it; Ctrl-D exits.
pub async fn run(runtime: Runtime) -> Completion {
    println!("flexicli ready. Type a prompt, or /help for commands.");
    let mut final_completion = Completion::Success;

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = match read_line().await {
            Some(line) => line,
            None => break, // EOF
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            match handle_command(&runtime, command).await {
                CommandResult::Continue => continue,
                CommandResult::Exit => break,
            }
        }

        let (abort_handle, abort_signal) = AbortHandle::new();
        let watcher = spawn_ctrl_c_watcher(abort_handle);
        let completion = runtime.execute_turn(input, abort_signal).await;
        watcher.abort();

        if completion == Completion::Aborted {
            // The turn was interrupted; the REPL itself keeps running, but
            // an exit right after reports the abort.
            final_completion = Completion::Aborted;
        } else {
            final_completion = completion;
        }
    }

    runtime.shutdown().await;
    final_completion
}

enum CommandResult {
    Continue,
    Exit,
}

async fn handle_command(runtime: &Runtime, command: &str) -> CommandResult {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or("") {
        "help" => {
            println!("/mode <direct|concise|deep>  switch token-budget mode");
            println!("/clear                       clear conversation memory");
            println!("/sessions                    list recent sessions");
            println!("/approve <always|never>      approval posture");
            println!("/exit                        quit");
            CommandResult::Continue
        }
        "mode" => {
            match parts.next().map(str::parse::<Mode>) {
                Some(Ok(mode)) => {
                    runtime.orchestrator.lock().await.set_mode(mode);
                    println!("mode set to {mode}");
                }
                _ => println!("usage: /mode <direct|concise|deep>"),
            }
            CommandResult::Continue
        }
        "clear" => {
            runtime.orchestrator.lock().await.memory_mut().clear_ephemeral();
            println!("conversation memory cleared");
            CommandResult::Continue
        }
        "sessions" => {
            match runtime.store.recent_sessions(10).await {
                Ok(sessions) => {
                    for s in sessions {
                        println!(
                            "{}  {:?}  turns={} tokens={} started={}",
                            s.id, s.status, s.turn_count, s.tokens_used, s.started_at,
                        );
                    }
                }
                Err(e) => println!("could not list sessions: {e}"),
            }
            CommandResult::Continue
        }
        "approve" => {
            match parts.next() {
                Some("always") => {
                    runtime.gate.set_mode(ApprovalMode::Yolo);
                    println!("auto-approving everything for this session");
                }
                Some("never") => {
                    runtime.gate.set_mode(ApprovalMode::Default);
                    runtime.gate.forget_all().await;
                    println!("approval prompts re-enabled, remembered answers dropped");
                }
                _ => println!("usage: /approve <always|never>"),
            }
            CommandResult::Continue
        }
        "exit" | "quit" => CommandResult::Exit,
        other => {
            println!("unknown command: /{other}");
            CommandResult::Continue
        }
    }
}

async fn read_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    })
    .await
    .unwrap_or(None)
}

fn spawn_ctrl_c_watcher(handle: AbortHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting turn");
            handle.abort();
        }
    })
}
