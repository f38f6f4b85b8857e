use log::{error, info};

/// Entry point. The first CLI argument picks the mode: a token beginning
/// with `/d` runs the receiver in-process with chattier logging (the
/// daemon/debug mode); anything else assumes an external supervisor
/// (systemd, runit, ...) owns the process lifecycle. Service installation
/// itself is the supervisor's job, not ours.
#[tokio::main]
async fn main() {
    let first_arg = std::env::args().nth(1);
    let debug_mode = first_arg
        .as_deref()
        .is_some_and(|arg| arg.to_ascii_lowercase().starts_with("/d"));

    env_logger::init_from_env(env_logger::Env::default().filter_or(
        env_logger::DEFAULT_FILTER_ENV,
        if debug_mode { "debug" } else { "info" },
    ));

    if !debug_mode {
        info!("running in supervised mode; pass /d for the in-process debug mode");
    }

    match mailrecv::run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("Application error: {err:#}");
            std::process::exit(1);
        }
    }
}
