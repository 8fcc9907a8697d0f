use std::io::{self, BufRead, StdinLock, Stderr, Write};

use tracing::warn;

use crate::text::sanitize_text;

pub const DEFAULT_ABORT_KEY: &str = "q";

/// Per-item confirmation with a sticky abort state.
pub trait Confirm {
    fn confirm_action(&mut self, item: &str, description: &str) -> bool;
    fn is_aborted(&self) -> bool;
}

/// Yes/no prompt over any line source. Once the abort keyword is entered every
/// later call returns `false` without prompting.
pub struct InteractiveHandler<R, W> {
    input: R,
    output: W,
    default_response: bool,
    abort_value: Option<String>,
    aborted: bool,
}

impl InteractiveHandler<StdinLock<'static>, Stderr> {
    /// Prompt on stderr and read answers from stdin.
    pub fn stdio(default_response: bool, abort_value: Option<&str>) -> Self {
        Self::new(io::stdin().lock(), io::stderr(), default_response, abort_value)
    }
}

impl<R: BufRead, W: Write> InteractiveHandler<R, W> {
    pub fn new(input: R, output: W, default_response: bool, abort_value: Option<&str>) -> Self {
        Self {
            input,
            output,
            default_response,
            abort_value: abort_value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
            aborted: false,
        }
    }

    pub fn reset(&mut self) {
        self.aborted = false;
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn prompt(&mut self, item: &str, description: &str) -> io::Result<Option<String>> {
        let default_hint = if self.default_response { "Y/n" } else { "y/N" };
        let mut prompt = format!("{description} {} [{default_hint}]", sanitize_text(item));
        if let Some(abort) = &self.abort_value {
            prompt.push_str(&format!(" (Enter '{abort}' to abort all remaining operations)"));
        }
        write!(self.output, "{prompt}: ")?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_lowercase()))
    }

    fn abort(&mut self) {
        self.aborted = true;
        let _ = writeln!(self.output, "Aborting all remaining operations.");
    }
}

impl<R: BufRead, W: Write> Confirm for InteractiveHandler<R, W> {
    fn confirm_action(&mut self, item: &str, description: &str) -> bool {
        if self.aborted {
            return false;
        }

        let response = match self.prompt(item, description) {
            Ok(Some(response)) => response,
            Ok(None) => {
                warn!("confirmation input closed; aborting remaining operations");
                self.abort();
                return false;
            }
            Err(err) => {
                warn!("failed to read confirmation: {err}");
                self.abort();
                return false;
            }
        };

        if let Some(abort) = &self.abort_value
            && response.eq_ignore_ascii_case(abort)
        {
            self.abort();
            return false;
        }

        match response.as_str() {
            "y" | "yes" => true,
            "n" | "no" => false,
            _ => self.default_response,
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted
    }
}
