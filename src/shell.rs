//! The interactive prompt.
//!
//! Commands are matched by unambiguous prefix (`dr` runs `draw`; `t`
//! complains and lists `tree`/`trees`). A couple of commands auto-repeat:
//! hitting enter on an empty line re-runs the last `march` or `next`.

use std::io::{BufRead, Write};
use std::sync::Arc;

use console::style;
use tracing::{error, info};

use crate::diagram::{Diagram, DiagramOpts};
use crate::error::{Error, Result};
use crate::log::{self, Category};
use crate::process::ProcessId;
use crate::tracer::{Control, Tracer};
use crate::view;

pub struct Session {
    pub tracer: Tracer,
    /// Roots of the process trees, one per `start`.
    pub trees: Vec<ProcessId>,
    pub diagram: DiagramOpts,
    pub colour: bool,
    pub force_scroll_view: bool,
    pub control: Arc<Control>,
}

enum Outcome {
    Continue,
    Quit,
}

struct CommandDef {
    name: &'static str,
    params: &'static str,
    brief: &'static str,
    auto_repeat: bool,
}

const COMMANDS: &[CommandDef] = &[
    CommandDef { name: "quit", params: "", brief: "quit forktrace", auto_repeat: false },
    CommandDef { name: "start", params: "PROGRAM [ARGS...]", brief: "start a tracee program", auto_repeat: false },
    CommandDef { name: "run", params: "PROGRAM [ARGS...]", brief: "start a tracee and run it to the end", auto_repeat: false },
    CommandDef { name: "march", params: "", brief: "resume all tracees until they all stop again", auto_repeat: true },
    CommandDef { name: "next", params: "", brief: "march, then draw the newest tree", auto_repeat: true },
    CommandDef { name: "go", params: "", brief: "resume until all tracees have ended", auto_repeat: false },
    CommandDef { name: "list", params: "", brief: "print a list of the active tracees", auto_repeat: false },
    CommandDef { name: "tree", params: "[INDEX]", brief: "dump a process tree (all trees if no index)", auto_repeat: false },
    CommandDef { name: "trees", params: "", brief: "list the process trees", auto_repeat: false },
    CommandDef { name: "draw", params: "[INDEX]", brief: "draw the diagram for a process tree", auto_repeat: false },
    CommandDef { name: "view", params: "[INDEX]", brief: "open a diagram in the scroll viewer", auto_repeat: false },
    CommandDef { name: "colour", params: "yes|no", brief: "enable/disable colour", auto_repeat: false },
    CommandDef { name: "non-fatal", params: "yes|no", brief: "show or hide non-fatal signals", auto_repeat: false },
    CommandDef { name: "execs", params: "yes|no", brief: "show or hide successful execs", auto_repeat: false },
    CommandDef { name: "bad-execs", params: "yes|no", brief: "show or hide failed execs", auto_repeat: false },
    CommandDef { name: "signal-sends", params: "yes|no", brief: "show or hide sent signals", auto_repeat: false },
    CommandDef { name: "merge-execs", params: "yes|no", brief: "merge retried execs of the same program", auto_repeat: false },
    CommandDef { name: "lane-width", params: "WIDTH", brief: "set the diagram lane width", auto_repeat: false },
    CommandDef { name: "verbose", params: "yes|no", brief: "enable/disable extra log messages", auto_repeat: false },
    CommandDef { name: "debug", params: "yes|no", brief: "enable/disable debug messages", auto_repeat: false },
    CommandDef { name: "log", params: "yes|no", brief: "enable/disable ordinary log messages", auto_repeat: false },
    CommandDef { name: "help", params: "", brief: "show this help", auto_repeat: false },
];

pub fn parse_bool(input: &str) -> Result<bool> {
    match input {
        "yes" | "y" | "true" | "on" | "enabled" | "1" => Ok(true),
        "no" | "n" | "false" | "off" | "disabled" | "0" => Ok(false),
        other => Err(Error::Parse(format!("expected yes or no, not \"{other}\""))),
    }
}

fn parse_number(input: &str) -> Result<usize> {
    input
        .parse()
        .map_err(|_| Error::Parse(format!("\"{input}\" is not a valid number")))
}

/// Resolve a command-name prefix. Exact matches win; otherwise the prefix
/// must be unambiguous.
fn find_command(name: &str) -> Result<&'static CommandDef> {
    if let Some(def) = COMMANDS.iter().find(|def| def.name == name) {
        return Ok(def);
    }
    let matches: Vec<&CommandDef> = COMMANDS
        .iter()
        .filter(|def| def.name.starts_with(name))
        .collect();
    match matches.len() {
        0 => Err(Error::Parse(format!(
            "unknown command \"{name}\" (try \"help\")"
        ))),
        1 => Ok(matches[0]),
        _ => {
            let names: Vec<&str> = matches.iter().map(|def| def.name).collect();
            Err(Error::Parse(format!(
                "\"{name}\" is ambiguous: {}",
                names.join(", ")
            )))
        }
    }
}

impl Session {
    pub fn start(&mut self, args: &[String]) -> Result<()> {
        if args.is_empty() {
            return Err(Error::Parse("expected: PROGRAM [ARGS...]".into()));
        }
        let root = self.tracer.start(&args[0], args.to_vec())?;
        self.trees.push(root);
        Ok(())
    }

    /// Resume everything until all tracees are gone.
    pub fn go(&mut self) -> Result<()> {
        while self.tracer.step()? {}
        Ok(())
    }

    fn march(&mut self) -> Result<()> {
        if !self.tracer.tracees_alive() {
            eprintln!("There are no active tracees.");
        }
        self.tracer.step()?;
        Ok(())
    }

    fn tree_index(&self, args: &[String]) -> Result<usize> {
        if self.trees.is_empty() {
            return Err(Error::Parse("there are no process trees yet".into()));
        }
        match args.first() {
            None => Ok(self.trees.len() - 1),
            Some(arg) => {
                let index = parse_number(arg)?;
                if index >= self.trees.len() {
                    return Err(Error::Parse("out-of-bounds process tree index".into()));
                }
                Ok(index)
            }
        }
    }

    /// Print a tree's diagram. Reports truncation so the user knows to
    /// widen the lanes.
    pub fn draw(&mut self, index: usize) -> Result<()> {
        let diagram = Diagram::new(self.tracer.tree(), self.trees[index], self.diagram);
        let mut out = std::io::stdout().lock();
        for line in diagram.grid().to_strings(self.colour) {
            let _ = writeln!(out, "{line}");
        }
        if diagram.truncated() {
            eprintln!(
                "Parts of the diagram were truncated; try a larger lane width \
                 (currently {}).",
                self.diagram.lane_width
            );
        }
        Ok(())
    }

    pub fn view(&mut self, index: usize) -> Result<()> {
        let diagram = Diagram::new(self.tracer.tree(), self.trees[index], self.diagram);
        view::scroll(diagram.grid(), self.colour)
    }

    /// Draw in instant mode: scroll-view when forced or when the diagram
    /// is too wide for the terminal, plain print otherwise.
    pub fn draw_or_view(&mut self, index: usize) -> Result<()> {
        let width = console::Term::stdout().size().1 as usize;
        let diagram = Diagram::new(self.tracer.tree(), self.trees[index], self.diagram);
        if self.force_scroll_view || diagram.grid().width() > width {
            view::scroll(diagram.grid(), self.colour)
        } else {
            self.draw(index)
        }
    }

    fn dump_trees(&self, args: &[String]) -> Result<()> {
        if args.len() > 1 {
            return Err(Error::Parse("expected no more than one argument".into()));
        }
        if self.trees.is_empty() {
            eprintln!("There are no process trees yet.");
            return Ok(());
        }
        let indexes: Vec<usize> = match args.first() {
            Some(_) => vec![self.tree_index(args)?],
            None => (0..self.trees.len()).collect(),
        };
        for index in indexes {
            eprintln!("{}", style(format!("Process tree {index}:")).bold());
            let mut out = String::new();
            self.tracer.tree().format_tree(self.trees[index], 0, &mut out);
            eprint!("{out}");
        }
        Ok(())
    }

    fn execute(&mut self, def: &CommandDef, args: Vec<String>) -> Result<Outcome> {
        match def.name {
            "quit" => return Ok(Outcome::Quit),
            "start" => self.start(&args)?,
            "run" => {
                self.start(&args)?;
                self.go()?;
            }
            "march" => self.march()?,
            "next" => {
                self.march()?;
                if !self.trees.is_empty() {
                    let index = self.trees.len() - 1;
                    self.draw(index)?;
                }
            }
            "go" => self.go()?,
            "list" => {
                for line in self.tracer.list_lines() {
                    eprintln!("{line}");
                }
            }
            "tree" => self.dump_trees(&args)?,
            "trees" => {
                if self.trees.is_empty() {
                    eprintln!("There are no process trees yet.");
                }
                for (index, root) in self.trees.iter().enumerate() {
                    eprintln!("{}: {}", index, self.tracer.tree().describe(*root));
                }
            }
            "draw" => {
                let index = self.tree_index(&args)?;
                self.draw(index)?;
            }
            "view" => {
                let index = self.tree_index(&args)?;
                self.view(index)?;
            }
            "colour" => {
                let enabled = parse_bool(one_arg(&args)?)?;
                self.colour = enabled;
                log::set_colour_enabled(enabled);
            }
            "non-fatal" => self.diagram.show_non_fatal_signals = parse_bool(one_arg(&args)?)?,
            "execs" => self.diagram.show_execs = parse_bool(one_arg(&args)?)?,
            "bad-execs" => self.diagram.show_failed_execs = parse_bool(one_arg(&args)?)?,
            "signal-sends" => self.diagram.show_signal_sends = parse_bool(one_arg(&args)?)?,
            "merge-execs" => {
                let enabled = parse_bool(one_arg(&args)?)?;
                self.tracer.set_merge_execs(enabled);
            }
            "lane-width" => {
                let width = parse_number(one_arg(&args)?)?;
                if width < 2 {
                    return Err(Error::Parse("lane width must be at least 2".into()));
                }
                self.diagram.lane_width = width;
            }
            "verbose" => log::set_category_enabled(Category::Verbose, parse_bool(one_arg(&args)?)?),
            "debug" => log::set_category_enabled(Category::Debug, parse_bool(one_arg(&args)?)?),
            "log" => log::set_category_enabled(Category::Log, parse_bool(one_arg(&args)?)?),
            "help" => print_help(),
            _ => unreachable!(),
        }
        Ok(Outcome::Continue)
    }
}

fn one_arg(args: &[String]) -> Result<&str> {
    match args {
        [arg] => Ok(arg),
        _ => Err(Error::Parse("expected exactly one argument".into())),
    }
}

fn print_help() {
    let padding = COMMANDS
        .iter()
        .map(|def| def.name.len() + 1 + def.params.len())
        .max()
        .unwrap_or(0)
        + 2;
    for def in COMMANDS {
        let left = if def.params.is_empty() {
            def.name.to_owned()
        } else {
            format!("{} {}", def.name, def.params)
        };
        eprintln!("  {left:<padding$}{}", def.brief);
    }
    eprintln!("\nCommands can be abbreviated to any unambiguous prefix.");
}

fn prompt(text: &str) -> Option<String> {
    eprint!("{text}");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) => None, // EOF
        Ok(_) => Some(line),
        Err(_) => None,
    }
}

fn confirm_quit(session: &Session, due_to_eof: bool) -> bool {
    if !session.tracer.tracees_alive() {
        if due_to_eof {
            eprintln!("EOF");
        }
        return true;
    }
    eprintln!("There are still tracees alive. Quitting will kill them.\n");
    match prompt("    Are you sure? (y/N) ") {
        None => {
            eprintln!("EOF");
            true
        }
        Some(line) => {
            let answer = line.trim();
            if answer == "y" || answer == "Y" {
                true
            } else {
                eprintln!();
                false
            }
        }
    }
}

/// Run the prompt until the user quits. Orphan notifications are drained
/// between commands so they are honoured even when nothing is stepping.
pub fn command_loop(session: &mut Session) {
    let mut last_repeatable: Option<&'static CommandDef> = None;
    loop {
        let Some(line) = prompt("(ft) ") else {
            if confirm_quit(session, true) {
                return;
            }
            continue;
        };
        let mut tokens: Vec<String> = line.split_whitespace().map(String::from).collect();

        let def = if tokens.is_empty() {
            match last_repeatable {
                Some(def) => def,
                None => continue,
            }
        } else {
            match find_command(&tokens.remove(0)) {
                Ok(def) => def,
                Err(err) => {
                    eprintln!("{err}");
                    continue;
                }
            }
        };
        last_repeatable = def.auto_repeat.then_some(def);

        match session.execute(def, tokens) {
            Ok(Outcome::Continue) => {}
            Ok(Outcome::Quit) => {
                if confirm_quit(session, false) {
                    return;
                }
            }
            Err(Error::Parse(msg)) => eprintln!("{msg}"),
            Err(err) => error!("{err}"),
        }
        if session.control.nuke_requested() {
            eprintln!("Interrupted: the tracees were killed.");
        }
        session.tracer.check_orphans();
    }
}

/// Instant mode: run one command from the command line start-to-finish,
/// then show every tree.
pub fn run_once(session: &mut Session, command: Vec<String>) -> bool {
    info!("Starting the command: {}", command.join(" "));
    if let Err(err) = session.start(&command).and_then(|_| session.go()) {
        error!("got error during trace: {err}");
        return false;
    }
    for index in 0..session.trees.len() {
        eprintln!("Process tree {index}:");
        if let Err(err) = session.draw_or_view(index) {
            error!("{err}");
            return false;
        }
    }
    true
}
