use std::sync::Arc;
use std::time::{Duration, Instant};

use iskra::{ChatRefusal, Simulation, Store, SystemClock, view};

use super::{Context, LlmArgs, build_generator};

const REPLY_POLL: Duration = Duration::from_millis(250);

/// Runs an engine for the length of one exchange: the message is submitted,
/// ticks keep going until the reply is committed or `wait` runs out.
pub(super) fn run_chat(
    ctx: &Context,
    agent_id: u64,
    user: &str,
    message: &str,
    wait: Duration,
    llm: LlmArgs,
) -> Result<(), String> {
    let mut config = ctx.load_config()?;
    let generator = build_generator(&mut config, &llm)?;
    let store: Arc<dyn Store> = ctx.store();

    let sim = Simulation::start(
        config,
        Arc::clone(&store),
        generator,
        Arc::new(SystemClock::new()),
        None,
        None,
    )
    .map_err(|e| e.to_string())?;

    let ticket = match sim.send_human_message(user, agent_id, message) {
        Ok(ticket) => ticket,
        Err(refusal) => {
            sim.stop();
            return Err(describe_refusal(&refusal));
        }
    };
    println!("{} is thinking...", ticket.agent);

    let deadline = Instant::now() + wait;
    let reply = loop {
        let data = store.load().map_err(|e| e.to_string())?;
        if let Some(reply) = view::check_response(&data, user, &ticket.conversation_id) {
            break Some(reply);
        }
        if Instant::now() >= deadline || !sim.is_running() {
            break None;
        }
        std::thread::sleep(REPLY_POLL);
    };
    sim.stop();

    match reply {
        Some(reply) => {
            println!("{}: {}", ticket.agent, reply);
            Ok(())
        }
        None => Err(format!(
            "no reply from {} within {}s (conversation {})",
            ticket.agent,
            wait.as_secs(),
            ticket.conversation_id
        )),
    }
}

fn describe_refusal(refusal: &ChatRefusal) -> String {
    match refusal.retry_after_secs() {
        Some(secs) => format!("{}; try again in {}s", refusal, secs),
        None => refusal.to_string(),
    }
}
