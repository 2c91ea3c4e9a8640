//! Interactive menu for the generate tool.
//!
//! Shown when the binary is started without a subcommand. Prompts for the
//! action and its paths, pre-filled with the same defaults the CLI flags
//! use.

use std::path::PathBuf;

use dialoguer::{Input, Select};

use crate::Action;

fn prompt_path(prompt: &str, default: PathBuf) -> Result<PathBuf, dialoguer::Error> {
    let value: String = Input::new()
        .with_prompt(prompt)
        .default(default.display().to_string())
        .interact_text()?;
    Ok(PathBuf::from(value.trim()))
}

/// Asks the user what to do.
///
/// # Errors
///
/// Returns [`dialoguer::Error`] if the terminal cannot be read.
pub fn prompt(events_db: PathBuf, grids_db: PathBuf) -> Result<Action, dialoguer::Error> {
    let choices = &[
        "Rebuild all grids",
        "Import alerts from NDJSON",
        "Show grid stats",
    ];

    let selection = Select::new()
        .with_prompt("What would you like to do?")
        .items(choices)
        .default(0)
        .interact()?;

    let action = match selection {
        0 => {
            let config: String = Input::new()
                .with_prompt("Config file (leave empty for built-in defaults)")
                .allow_empty(true)
                .interact_text()?;
            Action::Run {
                events_db: prompt_path("Events database", events_db)?,
                grids_db: prompt_path("Grids database", grids_db)?,
                config: Some(config.trim())
                    .filter(|c| !c.is_empty())
                    .map(PathBuf::from),
            }
        }
        1 => {
            let file: String = Input::new()
                .with_prompt("NDJSON file to import")
                .interact_text()?;
            Action::Import {
                file: PathBuf::from(file.trim()),
                events_db: prompt_path("Events database", events_db)?,
            }
        }
        _ => Action::Stats {
            grids_db: prompt_path("Grids database", grids_db)?,
        },
    };

    Ok(action)
}
