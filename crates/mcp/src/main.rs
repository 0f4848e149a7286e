#![forbid(unsafe_code)]

use cd_core::select::SelectionPolicy;
use cd_mcp::{AgentGrant, MethodSurface, serve_lines};
use cd_storage::SqliteStore;
use std::path::PathBuf;

fn usage() -> &'static str {
    "cd_mcp — Cadence method surface over stdio (line-delimited JSON-RPC)\n\n\
USAGE:\n\
  cd_mcp --database PATH [--plan-file PATH] [--role NAME]\n\n\
NOTES:\n\
  - One request per line on stdin; one response per line on stdout.\n\
  - `--role` binds the surface to a persisted agent grant; the default\n\
    `operator` role is unrestricted and meant for tooling, not agents.\n"
}

struct Args {
    database: PathBuf,
    plan_file: Option<PathBuf>,
    role: String,
}

fn parse_args() -> Result<Args, String> {
    let mut database: Option<PathBuf> = None;
    let mut plan_file: Option<PathBuf> = None;
    let mut role = "operator".to_string();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--database" => {
                database = Some(PathBuf::from(
                    args.next().ok_or("--database requires a value")?,
                ));
            }
            "--plan-file" => {
                plan_file = Some(PathBuf::from(
                    args.next().ok_or("--plan-file requires a value")?,
                ));
            }
            "--role" => {
                role = args.next().ok_or("--role requires a value")?;
            }
            "--help" | "-h" => {
                print!("{}", usage());
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    let database = database.ok_or("--database is required")?;
    Ok(Args {
        database,
        plan_file,
        role,
    })
}

fn resolve_grant(store: &SqliteStore, role: &str) -> Result<AgentGrant, String> {
    if role == "operator" {
        return Ok(AgentGrant::operator());
    }
    let agents = store
        .list_agents()
        .map_err(|e| format!("failed to load agents: {e}"))?;
    let Some(row) = agents.iter().find(|a| a.role == role) else {
        return Err(format!("unknown agent role: {role}"));
    };
    AgentGrant::from_agent_row(row)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprint!("{}", usage());
            std::process::exit(2);
        }
    };

    let store = SqliteStore::open(&args.database)?;
    let grant = match resolve_grant(&store, &args.role) {
        Ok(grant) => grant,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let mut surface = MethodSurface::new(
        store,
        grant,
        SelectionPolicy::default(),
        args.plan_file,
        None,
    );

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    serve_lines(&mut surface, stdin.lock(), &mut stdout)?;
    Ok(())
}
