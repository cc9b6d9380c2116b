// Terminal chat: the same session flow as the web UI, rendered to stdout.

use anyhow::{Context, Result};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::llm_interaction::CompletionClient;
use crate::profile::{join_labels, FitnessProfile};
use crate::session::{Session, SessionEvent, TurnOutcome};

pub const QUIT_COMMAND: &str = "/quit";
pub const RESET_COMMAND: &str = "/reset";

fn write_banner<W: Write>(output: &mut W, profile: &FitnessProfile) -> Result<()> {
    writeln!(output, "Fitness Coach Bot")?;
    writeln!(output, "  Fitness Level: {}", profile.fitness_level)?;
    writeln!(output, "  Goals: {}", join_labels(&profile.goals))?;
    writeln!(output, "  Injuries/Limitations: {}", join_labels(&profile.injuries))?;
    writeln!(output, "  Preferences: {}", join_labels(&profile.preferences))?;
    writeln!(
        output,
        "Ask me anything about fitness, workouts, or your goals! ({} to exit, {} to start over)",
        QUIT_COMMAND, RESET_COMMAND
    )?;
    output.flush()?;
    Ok(())
}

async fn render<W: Write>(output: &mut W, mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> Result<()> {
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::TurnStart => write!(output, "coach> ")?,
            SessionEvent::Fragment { text } => write!(output, "{}", text)?,
            SessionEvent::TurnEnd { .. } => writeln!(output)?,
            // the user's own line is already on screen
            _ => {}
        }
        output.flush()?;
    }
    Ok(())
}

/// Reads chat lines from `input` until EOF or `/quit`, streaming replies to `output`.
pub async fn run_chat<R, W>(
    client: &dyn CompletionClient,
    profile: FitnessProfile,
    input: R,
    output: &mut W,
) -> Result<Session>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut session = Session::with_profile(profile.clone());
    write_banner(output, session.profile())?;

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read chat input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == QUIT_COMMAND {
            break;
        }
        if line == RESET_COMMAND {
            // keep the profile chosen on the command line
            session = Session::with_profile(profile.clone());
            writeln!(output, "(conversation cleared)")?;
            continue;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session_ref = &mut session;
        let turn = async move { session_ref.run_turn(client, line, &tx).await };
        let (outcome, rendered) = tokio::join!(turn, render(output, rx));
        rendered?;

        match outcome {
            Ok(TurnOutcome::Completed { recorded: true, .. }) => {
                info!("Workout query logged to history");
            }
            Ok(_) => {}
            Err(e) => {
                error!("Chat turn failed: {}", e);
                writeln!(output, "\nerror: {}", e)?;
            }
        }
    }

    info!(turns = session.log().turns(), "Chat session finished");
    Ok(session)
}
