use crate::cli::HistoryCommand;
use crate::config::Config;
use crate::error::Result;
use crate::storage::{ConversationStore, Role};
use colored::Colorize;
use prettytable::{format, Table};

/// Handle history commands
///
/// Works directly on the conversations directory; it is safe to run while
/// the server is stopped. Running it against a live server's directory
/// shows what has been persisted so far.
pub async fn handle_history(config: &Config, command: HistoryCommand) -> Result<()> {
    let store = ConversationStore::open(&config.storage.conversations_dir).await?;

    match command {
        HistoryCommand::List => {
            let summaries = store.summaries().await;

            if summaries.is_empty() {
                println!("{}", "No conversation history found.".yellow());
                return Ok(());
            }

            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
            table.add_row(prettytable::row!["ID".bold(), "Messages".bold(), "Preview".bold()]);

            for summary in summaries {
                let first_prompt = store
                    .get(&summary.id)
                    .await
                    .and_then(|messages| messages.into_iter().find(|m| m.role == Role::User))
                    .map(|m| preview(&m.content))
                    .unwrap_or_else(|| "-".to_string());

                table.add_row(prettytable::row![
                    summary.id.cyan(),
                    summary.message_count,
                    first_prompt
                ]);
            }

            println!("\nConversation History:");
            table.printstd();
            println!();
        }
        HistoryCommand::Show { id } => {
            let Some(messages) = store.get(&id).await else {
                println!("{}", format!("No conversation with id {}", id).yellow());
                return Ok(());
            };

            println!("\nConversation {}:\n", id.cyan());
            for message in messages {
                let label = match message.role {
                    Role::User => "user".green().bold(),
                    Role::Assistant => "assistant".blue().bold(),
                };
                println!("{}: {}\n", label, message.content);
            }
        }
        HistoryCommand::Delete { id } => {
            if store.delete(&id).await? {
                println!("{}", format!("Deleted conversation {}", id).green());
            } else {
                println!("{}", format!("No conversation with id {}", id).yellow());
            }
        }
    }

    Ok(())
}

/// First line of a message, shortened for the listing table
fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default();
    if line.chars().count() > 40 {
        let head: String = line.chars().take(37).collect();
        format!("{}...", head)
    } else {
        line.to_string()
    }
}
