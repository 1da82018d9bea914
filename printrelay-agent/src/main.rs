use clap::Parser;
use printrelay_agent::{
    PrintAgent,
    host::{ConsoleHost, ExecutionHost, HostError, LogStatusReporter, ServiceHost, signal_controls},
    logging::{LogSink, default_log_path, init_logging},
    settings::{AgentArgs, RunMode},
};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = AgentArgs::parse();

    let sink = match (args.mode, args.settings.log_file.clone()) {
        (_, Some(path)) => LogSink::File(path),
        (RunMode::Console, None) => LogSink::Stdout,
        (RunMode::Service, None) => LogSink::File(default_log_path("printrelay-agent")),
    };
    init_logging(&sink);

    let config = match args.settings.resolve() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid settings: {}", err);
            std::process::exit(2);
        }
    };

    info!("print agent starting in {:?} mode", args.mode);
    let agent = PrintAgent::from_config(config);
    let result = match args.mode {
        RunMode::Console => ConsoleHost::until_ctrl_c().run(agent).await,
        RunMode::Service => match signal_controls() {
            Ok(controls) => ServiceHost::new(controls, LogStatusReporter).run(agent).await,
            Err(err) => Err(HostError::Signals(err)),
        },
    };

    if let Err(err) = result {
        error!("{}", err);
        std::process::exit(1);
    }
    info!("print agent stopped");
}
