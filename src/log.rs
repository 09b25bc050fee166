//! The forktrace logger.
//!
//! The library logs through the `tracing` macros; the five levels map onto
//! the five message categories (error, warning, log, verbose, debug). Each
//! category can be toggled independently at runtime, which is what the
//! `verbose`/`debug`/`log` shell commands flip. Messages go to stderr, one
//! `[forktrace] ` prefix per line, coloured when enabled and stderr is a tty.

use std::fmt::Write as _;
use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use console::Style;
use tracing::field::{Field, Visit};
use tracing::span;
use tracing::{Event, Level, Metadata, Subscriber};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Category {
    Error,
    Warn,
    Log,
    Verbose,
    Debug,
}

impl Category {
    fn index(self) -> usize {
        match self {
            Category::Error => 0,
            Category::Warn => 1,
            Category::Log => 2,
            Category::Verbose => 3,
            Category::Debug => 4,
        }
    }

    fn from_level(level: &Level) -> Category {
        match *level {
            Level::ERROR => Category::Error,
            Level::WARN => Category::Warn,
            Level::INFO => Category::Log,
            Level::DEBUG => Category::Verbose,
            Level::TRACE => Category::Debug,
        }
    }
}

// error/warn/log on by default, verbose/debug off.
static ENABLED: [AtomicBool; 5] = [
    AtomicBool::new(true),
    AtomicBool::new(true),
    AtomicBool::new(true),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

static COLOUR: AtomicBool = AtomicBool::new(true);

pub fn set_category_enabled(category: Category, enabled: bool) {
    ENABLED[category.index()].store(enabled, Ordering::Relaxed);
}

pub fn is_category_enabled(category: Category) -> bool {
    ENABLED[category.index()].load(Ordering::Relaxed)
}

pub fn set_colour_enabled(enabled: bool) {
    COLOUR.store(enabled, Ordering::Relaxed);
}

pub fn colour_enabled() -> bool {
    COLOUR.load(Ordering::Relaxed)
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }
}

struct ForktraceSubscriber;

impl Subscriber for ForktraceSubscriber {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        is_category_enabled(Category::from_level(metadata.level()))
    }

    fn new_span(&self, _attrs: &span::Attributes<'_>) -> span::Id {
        span::Id::from_u64(1)
    }

    fn record(&self, _span: &span::Id, _values: &span::Record<'_>) {}

    fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        emit(Category::from_level(event.metadata().level()), &visitor.message);
    }

    fn enter(&self, _span: &span::Id) {}

    fn exit(&self, _span: &span::Id) {}
}

fn emit(category: Category, message: &str) {
    let colour = colour_enabled() && std::io::stderr().is_terminal();
    let (tag, style) = match category {
        Category::Error => ("error: ", Style::new().red().bold()),
        Category::Warn => ("warning: ", Style::new().yellow().bold()),
        Category::Log => ("", Style::new()),
        Category::Verbose => ("", Style::new()),
        Category::Debug => ("debug: ", Style::new().dim()),
    };

    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    for line in message.split('\n') {
        let _ = if colour && !tag.is_empty() {
            writeln!(out, "[forktrace] {}{}", style.apply_to(tag), line)
        } else {
            writeln!(out, "[forktrace] {tag}{line}")
        };
    }
}

/// Install the logger. Call once, at the very start of main.
pub fn init() {
    // A second init (e.g. from tests) is harmless.
    let _ = tracing::subscriber::set_global_default(ForktraceSubscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_toggle_independently() {
        assert!(is_category_enabled(Category::Log));
        assert!(!is_category_enabled(Category::Debug));
        set_category_enabled(Category::Debug, true);
        assert!(is_category_enabled(Category::Debug));
        assert!(!is_category_enabled(Category::Verbose));
        set_category_enabled(Category::Debug, false);
    }
}
