use clap::Parser;
use nowdb::session::Library;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

const BANNER: &str = r"
 _   _   ___   _    _  ____  ____
| \ | | / _ \ | |  | ||  _ \| __ )
|  \| || | | || |/\| || | | |  _ \
| |\  || |_| ||  /\  || |_| | |_) |
|_| \_| \___/ |__/\__||____/|____/
";

/// The NoWDB daemon: accepts client connections and dispatches them to
/// session threads.
#[derive(Parser, Debug)]
#[command(name = "nowdbd", version, disable_help_flag = true)]
struct Args {
    /// Base path holding the scopes.
    #[arg(short = 'b', default_value = "./nowdb")]
    base: PathBuf,

    /// Port or service to listen on.
    #[arg(short = 'p', default_value = "55505")]
    port: String,

    /// Bind address.
    #[arg(short = 's', default_value = "127.0.0.1")]
    bind: String,

    /// Maximum number of concurrent connections.
    #[arg(short = 'c', default_value_t = 32)]
    connections: usize,

    /// Enable the Lua procedure host.
    #[arg(short = 'l', default_value_t = false)]
    lua: bool,

    /// Enable the Python procedure host.
    #[arg(short = 'y', default_value_t = false)]
    python: bool,

    /// Log per-statement timing.
    #[arg(short = 't', default_value_t = false)]
    timing: bool,

    /// Quiet: errors only.
    #[arg(short = 'q', default_value_t = false)]
    quiet: bool,

    /// Suppress the banner.
    #[arg(short = 'n', default_value_t = false)]
    nobanner: bool,

    /// Print help.
    #[arg(short = 'h', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn main() {
    let args = Args::parse();
    nowdb::logger::init_console(Some(if args.quiet { "error" } else { "info" }));
    if !args.nobanner {
        println!("{BANNER}");
    }

    let lib = match Library::new(&args.base, args.connections) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("nowdbd: cannot initialise library: {e}");
            std::process::exit(1);
        }
    };
    lib.set_timing(args.timing);
    if args.lua || args.python {
        log::warn!("procedure hosts are external; exec will report not-supp");
    }

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = match TcpListener::bind(&addr) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("nowdbd: cannot bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    log::info!("nowdbd listening on {addr}");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let input = match stream.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!("accept: cannot clone stream: {e}");
                        continue;
                    }
                };
                if let Err(e) = lib.get_session(Box::new(input), Box::new(stream)) {
                    log::error!("cannot dispatch session: {e}");
                }
            }
            Err(e) => {
                log::error!("accept failed: {e}");
                break;
            }
        }
    }

    lib.shutdown();
    if let Err(e) = lib.close() {
        eprintln!("nowdbd: shutdown failed: {e}");
        std::process::exit(1);
    }
}
