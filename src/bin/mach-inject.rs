use std::path::PathBuf;
use std::process::ExitCode;

/// Thin CLI front end: `mach-inject <pid> <path>`.
fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args_os().skip(1);
    let (Some(pid_arg), Some(path_arg), None) = (args.next(), args.next(), args.next()) else {
        eprintln!("usage: mach-inject <pid> <path-to-dylib>");
        return ExitCode::FAILURE;
    };

    let pid: i32 = match pid_arg.to_string_lossy().parse() {
        Ok(pid) => pid,
        Err(_) => {
            eprintln!("invalid pid: {}", pid_arg.to_string_lossy());
            return ExitCode::FAILURE;
        }
    };

    let path = PathBuf::from(path_arg);

    match mach_inject::inject(pid, &path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("injection failed: {err}");
            ExitCode::FAILURE
        }
    }
}
