//! Reply framing shared by the Mesytec NIM modules.
//!
//! A request is `MNEMONIC args\r`. The module echoes the request, prints zero or more
//! body lines and finishes with a prompt ending in `>`. Line endings are a mix of CR
//! and LF depending on the module, so both are treated as separators and blank lines
//! are dropped.

use crate::error::{NimError, NimResult};

/// One parsed request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The module's echo of the request.
    pub echo: String,
    /// Lines between the echo and the prompt.
    pub body: Vec<String>,
    /// The trailing prompt, e.g. `mhv4>`.
    pub prompt: String,
}

impl Reply {
    /// True once `raw` holds a complete reply (ends with the prompt character).
    pub fn is_complete(raw: &str) -> bool {
        raw.trim_end().ends_with('>')
    }

    /// Split a complete reply to `frame`.
    ///
    /// # Errors
    ///
    /// `Protocol` if the prompt or echo is missing, the echo belongs to a different
    /// request, or the module reported an error line.
    pub fn parse(frame: &str, raw: &str) -> NimResult<Self> {
        let mut lines: Vec<String> = raw
            .split(|c: char| c == '\r' || c == '\n')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let prompt = match lines.pop() {
            Some(p) if p.ends_with('>') => p,
            _ => {
                return Err(NimError::Protocol(format!(
                    "reply to '{frame}' has no prompt: {raw:?}"
                )))
            }
        };
        if lines.is_empty() {
            return Err(NimError::Protocol(format!("reply to '{frame}' has no echo")));
        }
        let echo = lines.remove(0);
        if !echo.eq_ignore_ascii_case(frame.trim()) {
            return Err(NimError::Protocol(format!(
                "echo mismatch: sent '{frame}', got '{echo}'"
            )));
        }
        if let Some(err) = lines.iter().find(|l| l.to_ascii_uppercase().starts_with("ERROR")) {
            return Err(NimError::Protocol(format!("'{frame}' rejected: {err}")));
        }

        Ok(Self {
            echo,
            body: lines,
            prompt,
        })
    }

    /// First body line, if any.
    pub fn first_line(&self) -> Option<&str> {
        self.body.first().map(String::as_str)
    }

    /// Whitespace-separated tokens of the whole body.
    pub fn tokens(&self) -> Vec<&str> {
        self.body.iter().flat_map(|l| l.split_whitespace()).collect()
    }

    /// Last token of the body that parses as a number.
    pub fn last_number(&self) -> Option<f64> {
        self.tokens()
            .into_iter()
            .rev()
            .find_map(|t| t.parse::<f64>().ok())
    }
}
