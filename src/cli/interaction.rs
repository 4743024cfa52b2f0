use std::io::{stdin, stdout, BufRead, Write};

use eyre::{eyre, WrapErr};
use owo_colors::OwoColorize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PromptChoice {
    Yes,
    No,
    Explain,
}

impl PromptChoice {
    fn parse(input: &str, default: PromptChoice) -> PromptChoice {
        match &*input.trim().to_lowercase() {
            "y" | "yes" => PromptChoice::Yes,
            "n" | "no" => PromptChoice::No,
            "e" | "explain" => PromptChoice::Explain,
            "" => default,
            _ => PromptChoice::No,
        }
    }
}

// Written through terminfo, the live ISO's console may be a bare VT without a sane stdout buffer.
pub(crate) async fn prompt(
    question: impl AsRef<str>,
    default: PromptChoice,
    explaining: bool,
) -> eyre::Result<PromptChoice> {
    let stdout = stdout();
    let mut term =
        term::terminfo::TerminfoTerminal::new(stdout).ok_or(eyre!("Couldn't get terminal"))?;

    let choice = |choice: PromptChoice, short: &'static str| match choice == default {
        true => short.to_uppercase(),
        false => short.to_string(),
    };
    let with_confirm = format!(
        "\
        {question}\n\
        \n\
        {are_you_sure} ({yes}/{no}{maybe_explain}): \
    ",
        question = question.as_ref(),
        are_you_sure = "Erase the disk and install?".bold(),
        yes = choice(PromptChoice::Yes, "y").green(),
        no = choice(PromptChoice::No, "n").red(),
        maybe_explain = match explaining {
            false => format!("/{}", choice(PromptChoice::Explain, "e").green()),
            true => String::new(),
        },
    );

    term.write_all(with_confirm.as_bytes())?;
    term.flush()?;

    Ok(PromptChoice::parse(&read_line()?, default))
}

pub(crate) fn read_line() -> eyre::Result<String> {
    let stdin = stdin();
    let stdin = stdin.lock();
    let mut lines = stdin.lines();
    let lines = lines.next().transpose()?;
    match lines {
        None => Err(eyre!("no lines found from stdin")),
        Some(v) => Ok(v),
    }
    .context("unable to read from stdin for confirmation")
}

pub(crate) async fn clean_exit_with_message(message: impl AsRef<str>) -> ! {
    eprintln!("{}", message.as_ref());
    std::process::exit(0)
}
