mod daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::daemon::{run_daemon, DaemonRunOptions, StorageTarget, DEFAULT_STREAM_NAME};

fn usage() -> String {
    format!(
        "usage: logcast_daemon (--local <dir> | --remote <url>) [options] -- <command> [args...]\n\
         options:\n\
         --name <file>       stream object name (default {})\n\
         --token <token>     bearer token for the remote store\n\
         --encoding <label>  child output encoding (default utf-8)",
        DEFAULT_STREAM_NAME
    )
}

fn parse_args() -> Result<DaemonRunOptions, String> {
    parse_arg_list(env::args().skip(1).collect())
}

fn parse_arg_list(args: Vec<String>) -> Result<DaemonRunOptions, String> {
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut target: Option<StorageTarget> = None;
    let mut stream_name = DEFAULT_STREAM_NAME.to_string();
    let mut session_token: Option<String> = None;
    let mut encoding = "utf-8".to_string();
    let mut command: Vec<String> = Vec::new();

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--local" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --local".to_string())?;
                if target.is_some() {
                    return Err("--local and --remote are mutually exclusive".to_string());
                }
                target = Some(StorageTarget::Local(PathBuf::from(value)));
            }
            "--remote" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --remote".to_string())?;
                if target.is_some() {
                    return Err("--local and --remote are mutually exclusive".to_string());
                }
                target = Some(StorageTarget::Remote(value.clone()));
            }
            "--name" => {
                i += 1;
                stream_name = args
                    .get(i)
                    .ok_or_else(|| "missing value for --name".to_string())?
                    .clone();
            }
            "--token" => {
                i += 1;
                session_token = Some(
                    args.get(i)
                        .ok_or_else(|| "missing value for --token".to_string())?
                        .clone(),
                );
            }
            "--encoding" => {
                i += 1;
                encoding = args
                    .get(i)
                    .ok_or_else(|| "missing value for --encoding".to_string())?
                    .clone();
            }
            "--" => {
                command = args[i + 1..].to_vec();
                break;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    let target = target.ok_or_else(|| format!("no storage target\n{}", usage()))?;
    if command.is_empty() {
        return Err(format!("no command to run\n{}", usage()));
    }

    Ok(DaemonRunOptions {
        target,
        stream_name,
        session_token,
        encoding,
        command,
    })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    match run_daemon(options) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("run logcast_daemon failed: {}", err);
            std::process::exit(1);
        }
    }
}
