//! Interactive arbitration for ambiguous class bindings and producer
//! conflicts. Only offered when stdin is a terminal; otherwise the engine
//! fails with the corresponding error instead of guessing.

use std::io::{BufRead, IsTerminal, Write};

use weft_core::resolve::{Arbiter, NoArbiter};

pub struct TtyArbiter;

impl Arbiter for TtyArbiter {
  fn choose(&self, prompt: &str, options: &[String]) -> Option<usize> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    println!("{prompt}:");
    for (index, option) in options.iter().enumerate() {
      println!("  {}) {option}", index + 1);
    }
    print!("choice [1-{}], or empty to abort: ", options.len());
    stdout.flush().ok()?;

    let mut line = String::new();
    stdin.lock().read_line(&mut line).ok()?;
    let choice: usize = line.trim().parse().ok()?;
    (1..=options.len()).contains(&choice).then(|| choice - 1)
  }
}

/// The best arbiter for the current environment.
pub fn default_arbiter() -> Box<dyn Arbiter> {
  if std::io::stdin().is_terminal() {
    Box::new(TtyArbiter)
  } else {
    Box::new(NoArbiter)
  }
}
