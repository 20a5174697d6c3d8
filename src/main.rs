use storyforge::cli::{self, CliError};
use storyforge::core::terminal;

#[tokio::main]
async fn main() {
    match cli::run_main().await {
        Ok(()) => {}
        Err(CliError::UnknownCommand(cmd)) => {
            terminal::print_error(&format!("Unknown command: {}", cmd));
            println!("Run `storyforge list-commands` to see what is available.");
            std::process::exit(2);
        }
        Err(CliError::Failed(e)) => {
            terminal::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}
