use std::io::IsTerminal;
use std::os::fd::AsRawFd;

use clap::Parser;
use tracing::error;

use forktrace::diagram::DiagramOpts;
use forktrace::log::{self, Category};
use forktrace::shell::{self, Session};
use forktrace::tracer::{Control, Tracer};
use forktrace::{reaper, syscalls};

/// Trace a process tree and draw it as a fork diagram.
///
/// With a program on the command line, forktrace runs it start to finish
/// and prints the diagram; with none, it drops into an interactive prompt.
#[derive(Parser, Debug)]
#[command(name = "forktrace", version, max_term_width = 100)]
struct Cli {
    /// Disable colours
    #[arg(short = 'c', long = "no-colour")]
    no_colour: bool,

    /// Disable the sub-reaper helper (orphans won't be tracked)
    #[arg(long = "no-reaper")]
    no_reaper: bool,

    /// Diagnose a wait(2) child status and exit
    #[arg(long, value_name = "STATUS")]
    status: Option<i32>,

    /// Print the name and arity of a syscall number and exit
    #[arg(long, value_name = "NUMBER")]
    syscall: Option<i64>,

    /// Always use the scroll viewer in instant mode
    #[arg(short = 's', long = "scroll-view")]
    scroll_view: bool,

    /// Show or hide non-fatal signals
    #[arg(long = "non-fatal", value_name = "yes|no", value_parser = parse_yes_no)]
    non_fatal: Option<bool>,

    /// Show or hide successful execs
    #[arg(long, value_name = "yes|no", value_parser = parse_yes_no)]
    execs: Option<bool>,

    /// Show or hide failed execs
    #[arg(long = "bad-execs", value_name = "yes|no", value_parser = parse_yes_no)]
    bad_execs: Option<bool>,

    /// Show or hide sent signals
    #[arg(long = "signal-sends", value_name = "yes|no", value_parser = parse_yes_no)]
    signal_sends: Option<bool>,

    /// Merge retried execs of the same program
    #[arg(long = "merge-execs", value_name = "yes|no", value_parser = parse_yes_no)]
    merge_execs: Option<bool>,

    /// Diagram lane width, in columns
    #[arg(long = "lane-width", value_name = "WIDTH")]
    lane_width: Option<usize>,

    /// Show more information than usual
    #[arg(short, long)]
    verbose: bool,

    /// Show debugging log messages
    #[arg(short, long)]
    debug: bool,

    /// Silence ordinary log messages
    #[arg(short = 'l', long = "no-log")]
    no_log: bool,

    /// The program to trace (and its arguments)
    #[arg(
        value_name = "PROGRAM [ARGS...]",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

fn parse_yes_no(input: &str) -> Result<bool, String> {
    shell::parse_bool(input).map_err(|err| err.to_string())
}

fn main() {
    log::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version are successes; anything else is usage error
            // and exits 1.
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp
                | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Some(status) = cli.status {
        println!("{}", syscalls::diagnose_wait_status(status));
        return;
    }
    if let Some(number) = cli.syscall {
        match syscalls::arg_count(number) {
            Some(args) => println!("{} ({} args)", syscalls::name(number), args),
            None => println!("{}", syscalls::name(number)),
        }
        return;
    }

    log::set_colour_enabled(!cli.no_colour);
    if cli.verbose {
        log::set_category_enabled(Category::Verbose, true);
    }
    if cli.debug {
        log::set_category_enabled(Category::Debug, true);
    }
    if cli.no_log {
        log::set_category_enabled(Category::Log, false);
    }

    std::process::exit(if run(cli) { 0 } else { 1 });
}

fn run(cli: Cli) -> bool {
    reaper::register_signals();

    // Block SIGINT before any threads exist so they all inherit the mask
    // and only the sigwaiter ever takes delivery.
    if let Err(err) = reaper::block_sigint() {
        error!("{err}");
        return false;
    }

    // This forks: the parent becomes the reaper and we carry on as the
    // child, with a new pid. Must happen before the tracer sees our pid.
    let reaper_pipe = if cli.no_reaper {
        None
    } else {
        match reaper::start_reaper() {
            Ok(pipe) => Some(pipe),
            Err(err) => {
                error!("failed to start reaper: {err}");
                return false;
            }
        }
    };

    let control = Control::new(!cli.no_reaper);
    let reader = reaper_pipe.map(|pipe| {
        let fd = pipe.as_raw_fd();
        (reaper::spawn_reader(control.clone(), pipe), fd)
    });
    let sigwaiter = reaper::spawn_sigwaiter(control.clone());

    let diagram = DiagramOpts {
        show_execs: cli.execs.unwrap_or(true),
        show_failed_execs: cli.bad_execs.unwrap_or(false),
        show_non_fatal_signals: cli.non_fatal.unwrap_or(false),
        show_signal_sends: cli.signal_sends.unwrap_or(true),
        lane_width: cli.lane_width.unwrap_or(4).max(2),
    };
    let mut session = Session {
        tracer: Tracer::new(control.clone(), cli.merge_execs.unwrap_or(true)),
        trees: Vec::new(),
        diagram,
        colour: !cli.no_colour && std::io::stdout().is_terminal(),
        force_scroll_view: cli.scroll_view,
        control: control.clone(),
    };

    let ok = if cli.command.is_empty() {
        shell::command_loop(&mut session);
        true
    } else {
        shell::run_once(&mut session, cli.command)
    };

    control.set_done();
    reaper::join_sigwaiter(sigwaiter);
    if let Some((handle, fd)) = reader {
        reaper::join_reader(handle, fd);
    }
    ok
}
