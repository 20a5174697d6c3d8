use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static QUILL: Emoji<'_, '_> = Emoji("🪶 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_banner() {
    println!(
        "\n{} {} {}\n",
        QUILL,
        style("storyforge").bold().magenta(),
        style("story versions and generation worker").dim()
    );
}

/// A titled block of `command  description` rows for help output.
pub struct GuideSection {
    title: String,
    rows: Vec<(String, String)>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, usage: &str, description: &str) -> Self {
        self.rows.push((usage.to_string(), description.to_string()));
        self
    }

    pub fn render(&self) -> String {
        let width = self.rows.iter().map(|(u, _)| u.len()).max().unwrap_or(0);
        let mut out = format!(" {}\n", style(&self.title).bold().underlined());
        for (usage, description) in &self.rows {
            out.push_str(&format!(
                "   {}  {}\n",
                style(format!("{:<width$}", usage, width = width)).green(),
                description
            ));
        }
        out
    }

    pub fn print(&self) {
        println!("{}", self.render());
    }
}
