use std::io::{self, Write};
use std::path::Path;

use clap::CommandFactory;
use clap_complete::{generate, shells};

use crate::cli::{Cli, CompletionShell};
use crate::error::CliError;

pub fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let script = render_completions(shell);

    if let Some(path) = output_path {
        std::fs::write(path, &script)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&script)?;
    }

    Ok(())
}

pub fn render_completions(shell: CompletionShell) -> Vec<u8> {
    let mut command = Cli::command();
    let bin_name = command.get_name().to_string();
    let mut script = Vec::new();
    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut command, bin_name, &mut script),
        CompletionShell::Zsh => generate(shells::Zsh, &mut command, bin_name, &mut script),
        CompletionShell::Fish => generate(shells::Fish, &mut command, bin_name, &mut script),
    }
    script
}
