#![cfg_attr(target_os = "windows", windows_subsystem = "windows")]

#[cfg(not(target_os = "windows"))]
fn main() {
    eprintln!("PrintRelay tray host currently supports Windows only; run printrelay-agent instead");
}

#[cfg(target_os = "windows")]
fn main() {
    windows_tray::run();
}

#[cfg(target_os = "windows")]
mod windows_tray {
    use std::{sync::mpsc, thread, time::Duration};

    use clap::Parser;
    use printrelay_agent::{
        PrintAgent,
        host::ExecutionHost,
        logging::{LogSink, default_log_path, init_logging},
        settings::{AgentConfig, SettingsArgs},
    };
    use printrelay_tray::{
        APP_NAME, TrayError, TrayEvent, TrayHost, TrayStatus, local_url, open_in_browser,
    };
    use tokio::sync::oneshot;
    use tracing::{error, info, warn};
    use tray_icon::{
        Icon, TrayIcon, TrayIconBuilder,
        menu::{Menu, MenuEvent, MenuItem},
    };
    use url::Url;
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        DispatchMessageW, MSG, PM_REMOVE, PeekMessageW, TranslateMessage,
    };

    const ICON_SIZE: u32 = 32;
    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    #[derive(Parser, Debug, Clone)]
    #[command(name = "PrintRelay")]
    struct TrayArgs {
        #[command(flatten)]
        settings: SettingsArgs,
    }

    fn icon_for(status: &TrayStatus) -> Result<Icon, TrayError> {
        Icon::from_rgba(status.icon_rgba(ICON_SIZE), ICON_SIZE, ICON_SIZE)
            .map_err(|err| TrayError::Icon(err.to_string()))
    }

    fn apply_status(tray: &TrayIcon, status: &TrayStatus) {
        match icon_for(status) {
            Ok(icon) => {
                if let Err(err) = tray.set_icon(Some(icon)) {
                    warn!("failed to update tray icon: {}", err);
                }
            }
            Err(err) => warn!("{}", err),
        }
        if let Err(err) = tray.set_tooltip(Some(status.tooltip())) {
            warn!("failed to update tray tooltip: {}", err);
        }
    }

    fn pump_messages() {
        // SAFETY: MSG is plain data and only messages for this thread are read.
        unsafe {
            let mut msg: MSG = std::mem::zeroed();
            while PeekMessageW(&mut msg, 0, 0, 0, PM_REMOVE) != 0 {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
    }

    pub fn run() {
        let args = TrayArgs::try_parse();
        let log_path = args
            .as_ref()
            .ok()
            .and_then(|args| args.settings.log_file.clone())
            .unwrap_or_else(|| default_log_path(APP_NAME));
        init_logging(&LogSink::File(log_path));

        let args = match args {
            Ok(args) => args,
            Err(err) => {
                error!("arg parse failed: {}", err);
                std::process::exit(2);
            }
        };
        let config = match args.settings.resolve() {
            Ok(config) => config,
            Err(err) => {
                error!("invalid settings: {}", err);
                std::process::exit(2);
            }
        };

        if let Err(err) = run_tray(config) {
            error!("{}", err);
            std::process::exit(1);
        }
        info!("tray host exited");
        std::process::exit(0);
    }

    fn run_tray(config: AgentConfig) -> Result<(), TrayError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(TrayError::Runtime)?;

        let (events_tx, events_rx) = mpsc::channel::<TrayEvent>();
        let (quit_tx, quit_rx) = oneshot::channel::<()>();
        let agent = PrintAgent::from_config(config);
        let server = runtime.spawn(TrayHost::new(events_tx, quit_rx).run(agent));

        let open_item = MenuItem::new("Open in browser", false, None);
        let quit_item = MenuItem::new("Quit", true, None);
        let menu = Menu::new();
        menu.append(&open_item)
            .map_err(|err| TrayError::Create(err.to_string()))?;
        menu.append(&quit_item)
            .map_err(|err| TrayError::Create(err.to_string()))?;

        let initial = TrayStatus::Starting;
        let tray = TrayIconBuilder::new()
            .with_menu(Box::new(menu))
            .with_tooltip(initial.tooltip())
            .with_icon(icon_for(&initial)?)
            .build()
            .map_err(|err| TrayError::Create(err.to_string()))?;

        let mut browse_url: Option<Url> = None;
        loop {
            pump_messages();

            while let Ok(event) = events_rx.try_recv() {
                let status = event.status();
                info!("tray status: {}", status.tooltip());
                if let TrayEvent::ListenerReady(addr) = event {
                    match local_url(addr) {
                        Ok(url) => {
                            browse_url = Some(url);
                            open_item.set_enabled(true);
                        }
                        Err(err) => warn!("cannot build browser address for {}: {}", addr, err),
                    }
                }
                apply_status(&tray, &status);
            }

            if let Ok(event) = MenuEvent::receiver().try_recv() {
                if event.id == *quit_item.id() {
                    info!("quit requested from tray menu");
                    break;
                }
                if event.id == *open_item.id() {
                    if let Some(url) = &browse_url {
                        if let Err(err) = open_in_browser(url) {
                            warn!("failed to open browser: {}", err);
                        }
                    }
                }
            }

            thread::sleep(POLL_INTERVAL);
        }

        let _ = quit_tx.send(());
        match runtime.block_on(server) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("{}", err),
            Err(err) => warn!("agent task failed: {}", err),
        }
        drop(tray);
        Ok(())
    }
}
