use colored::Colorize;
use serror::Serror;

pub fn muted(content: impl std::fmt::Display) -> String {
  content.to_string().dimmed().to_string()
}

pub fn bold(content: impl std::fmt::Display) -> String {
  content.to_string().bold().to_string()
}

pub fn colored(
  content: impl std::fmt::Display,
  color: Color,
) -> String {
  let content = content.to_string();
  match color {
    Color::Red => content.red(),
    Color::Green => content.green(),
    Color::Blue => content.blue(),
  }
  .to_string()
}

pub enum Color {
  Red,
  Green,
  Blue,
}

pub fn format_serror(Serror { error, trace }: &Serror) -> String {
  let trace = if !trace.is_empty() {
    let mut out = format!("\n\n{}:", muted("TRACE"));

    for (i, msg) in trace.iter().enumerate() {
      out.push_str(&format!("\n\t{}: {msg}", muted(i + 1)));
    }

    out
  } else {
    Default::default()
  };
  format!("{}: {error}{trace}", colored("ERROR", Color::Red))
}
