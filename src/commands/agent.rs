use clap::Subcommand;
use iskra::{AgentCategory, Store, agents, view};
use rand::thread_rng;

use super::Context;

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Create a new agent (name and category are random unless given)
    Create {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_enum)]
        category: Option<AgentCategory>,
    },
    /// Show an agent with its latest thoughts, memories and dialogue
    Info {
        id: u64,
        /// Entries per section
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// List all agents
    List,
}

pub(super) fn run_agent(ctx: &Context, cmd: AgentCommand) -> Result<(), String> {
    let store = ctx.store();

    match cmd {
        AgentCommand::Create { name, category } => {
            let config = ctx.load_config()?;
            let mut session = store.begin().map_err(|e| e.to_string())?;
            let id = agents::create_agent(
                &mut session,
                name,
                category,
                &config,
                &mut thread_rng(),
                chrono::Utc::now(),
            )
            .map_err(|e| e.to_string())?;
            let agent = session
                .agent(id)
                .cloned()
                .ok_or_else(|| format!("agent {} vanished before commit", id))?;
            store.commit(session).map_err(|e| e.to_string())?;
            println!(
                "Created agent {} {} ({}, energy={:.2}, at {})",
                agent.id, agent.name, agent.category, agent.energy, agent.position
            );
        }
        AgentCommand::Info { id, limit } => {
            let data = store.load().map_err(|e| e.to_string())?;
            let feed = view::agent_feed(&data, id, limit)
                .ok_or_else(|| format!("agent {} not found", id))?;
            let agent = &feed.agent;
            println!(
                "Agent {} {} | {} | mood={} | energy={:.2} | at {}",
                agent.id, agent.name, agent.category, agent.mood, agent.energy, agent.position
            );
            if !feed.thoughts.is_empty() {
                println!("Thoughts:");
                for thought in &feed.thoughts {
                    println!("  [cycle {}] {}", thought.cycle, thought.thought);
                }
            }
            if !feed.memories.is_empty() {
                println!("Memories:");
                for memory in &feed.memories {
                    println!("  [cycle {}] {}", memory.cycle, memory.content);
                }
            }
            if !feed.dialogues.is_empty() {
                println!("Dialogue:");
                for line in &feed.dialogues {
                    println!("  {} -> {}: {}", line.speaker, line.target, line.message);
                }
            }
        }
        AgentCommand::List => {
            let data = store.load().map_err(|e| e.to_string())?;
            if data.agents.is_empty() {
                println!("No agents found");
            } else {
                for agent in &data.agents {
                    println!(
                        "{} | {} | {} | mood={} | energy={:.2}",
                        agent.id, agent.name, agent.category, agent.mood, agent.energy
                    );
                }
            }
        }
    }

    Ok(())
}
