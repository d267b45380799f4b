//! Console rendering of engine progress.
//!
//! Engine output arrives as `(text, is_new_line)` pairs. An overwrite
//! replaces the last line shown. On a terminal this is done in place by
//! backing up to the first character that differs; otherwise only the final
//! state of each line is printed.

use std::io::{self, Write};

const BACKSPACE: &str = "\x08";

/// Number of leading characters two lines have in common.
fn common_prefix_chars(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

pub struct ConsoleProgress<W: Write> {
    out: W,
    interactive: bool,
    /// The line currently shown (interactive) or waiting to be printed.
    current: Option<String>,
}

impl<W: Write> ConsoleProgress<W> {
    pub fn new(out: W, interactive: bool) -> Self {
        ConsoleProgress {
            out,
            interactive,
            current: None,
        }
    }

    pub fn update(&mut self, text: &str, is_new_line: bool) -> io::Result<()> {
        match self.current.take() {
            Some(previous) if !is_new_line => {
                if self.interactive {
                    self.overwrite(&previous, text)?;
                }
            }
            Some(previous) => {
                if self.interactive {
                    writeln!(self.out)?;
                    write!(self.out, "{text}")?;
                } else {
                    writeln!(self.out, "{previous}")?;
                }
            }
            None => {
                if self.interactive {
                    write!(self.out, "{text}")?;
                }
            }
        }
        self.current = Some(text.to_string());
        self.out.flush()
    }

    fn overwrite(&mut self, previous: &str, text: &str) -> io::Result<()> {
        let common = common_prefix_chars(previous, text);
        let old_len = previous.chars().count();
        let new_len = text.chars().count();

        write!(self.out, "{}", BACKSPACE.repeat(old_len - common))?;
        write!(self.out, "{}", text.chars().skip(common).collect::<String>())?;
        if old_len > new_len {
            let excess = old_len - new_len;
            write!(self.out, "{}{}", " ".repeat(excess), BACKSPACE.repeat(excess))?;
        }
        Ok(())
    }

    /// Terminates the last line.
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(last) = self.current.take() {
            if self.interactive {
                writeln!(self.out)?;
            } else {
                writeln!(self.out, "{last}")?;
            }
        }
        self.out.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}
