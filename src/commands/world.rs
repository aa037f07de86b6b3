use clap::Subcommand;
use iskra::{Store, load_world_snapshot, save_world_snapshot, view};

use super::Context;

#[derive(Subcommand)]
pub enum WorldCommand {
    /// Latest world events, newest first
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Latest finalized dialogue lines, newest first
    Dialogues {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Latest agent thoughts, newest first
    Thoughts {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Recent finalized dialogue between two agents, oldest first
    Context {
        a: String,
        b: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// A user's chat history with one agent
    Chats {
        #[arg(long)]
        user: String,
        #[arg(long)]
        agent: u64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Export a world snapshot for a front end
    Snapshot {
        /// Print the snapshot JSON to stdout
        #[arg(long)]
        json: bool,
        /// Print the last exported snapshot instead of taking a new one
        #[arg(long)]
        cached: bool,
    },
}

pub(super) fn run_world(ctx: &Context, cmd: WorldCommand) -> Result<(), String> {
    if let WorldCommand::Snapshot { json, cached } = cmd {
        return run_snapshot(ctx, json, cached);
    }

    let data = ctx.store().load().map_err(|e| e.to_string())?;
    match cmd {
        WorldCommand::Events { limit } => {
            let events = view::latest_events(&data, limit);
            if events.is_empty() {
                println!("No events yet");
            }
            for event in events {
                println!("[cycle {}] {:?}: {}", event.cycle, event.kind, event.text);
            }
        }
        WorldCommand::Dialogues { limit } => {
            let lines = view::latest_dialogues(&data, limit);
            if lines.is_empty() {
                println!("No dialogue yet");
            }
            for line in lines {
                println!(
                    "[cycle {}] {} -> {} ({}): {}",
                    line.cycle,
                    line.speaker,
                    line.target,
                    line.kind.label(),
                    line.message
                );
            }
        }
        WorldCommand::Thoughts { limit } => {
            let thoughts = view::latest_thoughts(&data, limit);
            if thoughts.is_empty() {
                println!("No thoughts yet");
            }
            for thought in thoughts {
                println!("[cycle {}] {}: {}", thought.cycle, thought.agent, thought.thought);
            }
        }
        WorldCommand::Context { a, b, limit } => {
            let lines = view::dialogue_context(&data, &a, &b, limit);
            if lines.is_empty() {
                println!("{} and {} have not talked yet", a, b);
            }
            for line in lines {
                println!("{}: {}", line.speaker, line.message);
            }
        }
        WorldCommand::Chats { user, agent, limit } => {
            let lines = view::chat_history(&data, &user, agent, limit);
            if lines.is_empty() {
                println!("No chat between {} and agent {}", user, agent);
            }
            for line in lines {
                println!("{:?}: {}", line.sender, line.text);
            }
        }
        WorldCommand::Snapshot { .. } => {}
    }
    Ok(())
}

fn run_snapshot(ctx: &Context, json: bool, cached: bool) -> Result<(), String> {
    let snapshot = if cached {
        load_world_snapshot()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "no snapshot exported yet; run without --cached".to_string())?
    } else {
        let data = ctx.store().load().map_err(|e| e.to_string())?;
        let snapshot = view::world_snapshot(&data, chrono::Utc::now());
        let path = save_world_snapshot(&snapshot).map_err(|e| e.to_string())?;
        if !json {
            println!("Snapshot written to {}", path.display());
        }
        snapshot
    };

    if json {
        let text = serde_json::to_string_pretty(&snapshot).map_err(|e| e.to_string())?;
        println!("{}", text);
    } else {
        println!(
            "cycle={} | complexity={:.3} | agents={} | mean_energy={:.2} | dialogues={} | relationships={}",
            snapshot.cycle,
            snapshot.complexity,
            snapshot.agents.len(),
            snapshot.mean_energy,
            snapshot.dialogues,
            snapshot.relationships
        );
    }
    Ok(())
}
