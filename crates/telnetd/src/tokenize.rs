//! Command line tokenizer.

/// Maximum number of arguments, command name included.
pub const MAX_ARGS: usize = 32;

/// Tokens of one command line. Indexing past the end yields `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentVector {
    tokens: Vec<String>,
}

impl ArgumentVector {
    pub fn argc(&self) -> usize {
        self.tokens.len()
    }

    pub fn arg(&self, index: usize) -> &str {
        self.tokens.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn command(&self) -> &str {
        self.arg(0)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Split on the first space repeatedly. Each remainder is trimmed before it
/// is split again, so runs of spaces act as one delimiter. Whatever is left
/// after the 32nd token stays folded into it.
pub fn tokenize(line: &str) -> ArgumentVector {
    let mut tokens = Vec::new();
    let mut rest = line.trim();
    if rest.is_empty() {
        return ArgumentVector { tokens };
    }
    while tokens.len() < MAX_ARGS - 1 {
        match rest.find(' ') {
            Some(at) if at > 0 => {
                tokens.push(rest[..at].to_string());
                rest = rest[at + 1..].trim();
            }
            _ => break,
        }
    }
    tokens.push(rest.to_string());
    ArgumentVector { tokens }
}
