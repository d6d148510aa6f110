use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use bluetooth_car::domain::models::{BondState, Device, Direction, PairingStatus};
use bluetooth_car::domain::settings::SettingsService;
use bluetooth_car::domain::state::CarState;
use bluetooth_car::infrastructure::bluetooth::protocol::CarCommand;
use bluetooth_car::infrastructure::bluetooth::simulated::SimulatedRadio;
use bluetooth_car::infrastructure::bluetooth::BluetoothService;
use bluetooth_car::infrastructure::logging;

const HELP: &str = "\
commands:
  scan | stop-scan | bonded       discovery
  all on|off                      show unnamed devices
  pair <index|address>            bond (retrying default PINs) and connect
  pin <pin> | reset               answer a PIN prompt, clear pairing result
  connect <index|address>         open the serial session
  disconnect | clear              close the session, dismiss the error
  send <token>                    one raw command, e.g. send W
  hold <direction> | release      continuous movement (forward, back, left,
                                  right, forward-left, forward-right,
                                  back-left, back-right)
  horn on|off                     continuous horn
  front on|off | back on|off      lights
  say <phrase>                    interpret a spoken phrase
  status | help | quit";

enum ConsoleCommand {
    Scan,
    StopScan,
    Bonded,
    ShowAll(bool),
    Pair(String),
    Pin(String),
    Reset,
    Connect(String),
    Disconnect,
    ClearError,
    Send(CarCommand),
    Hold(Direction),
    Release,
    Horn(bool),
    FrontLight(bool),
    BackLight(bool),
    Say(String),
    Status,
    Help,
    Quit,
}

fn parse_switch(arg: &str) -> Result<bool> {
    match arg {
        "on" => Ok(true),
        "off" => Ok(false),
        other => bail!("expected on or off, got {:?}", other),
    }
}

fn parse_direction(arg: &str) -> Result<Direction> {
    Ok(match arg {
        "forward" | "f" => Direction::Forward,
        "back" | "backward" | "b" => Direction::Backward,
        "left" | "l" => Direction::Left,
        "right" | "r" => Direction::Right,
        "forward-left" => Direction::ForwardLeft,
        "forward-right" => Direction::ForwardRight,
        "back-left" => Direction::BackwardLeft,
        "back-right" => Direction::BackwardRight,
        other => bail!("unknown direction {:?}", other),
    })
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let need = |what: &str| {
            if rest.is_empty() {
                Err(anyhow!("{} needs {}", word, what))
            } else {
                Ok(rest.to_string())
            }
        };

        Ok(match word {
            "scan" => Self::Scan,
            "stop-scan" => Self::StopScan,
            "bonded" => Self::Bonded,
            "all" => Self::ShowAll(parse_switch(rest)?),
            "pair" => Self::Pair(need("a device")?),
            "pin" => Self::Pin(need("a PIN")?),
            "reset" => Self::Reset,
            "connect" => Self::Connect(need("a device")?),
            "disconnect" => Self::Disconnect,
            "clear" => Self::ClearError,
            "send" => Self::Send(need("a token")?.parse()?),
            "hold" => Self::Hold(parse_direction(rest)?),
            "release" => Self::Release,
            "horn" => Self::Horn(parse_switch(rest)?),
            "front" => Self::FrontLight(parse_switch(rest)?),
            "back" => Self::BackLight(parse_switch(rest)?),
            "say" => Self::Say(need("a phrase")?),
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command {:?}, try help", other),
        })
    }
}

/// A list index from the printed device list, or an address
fn resolve_device(state: &CarState, target: &str) -> Device {
    let devices = state.devices.get();
    if let Some(device) = target.parse::<usize>().ok().and_then(|i| devices.get(i)) {
        return device.clone();
    }
    devices
        .into_iter()
        .find(|d| d.address.eq_ignore_ascii_case(target))
        .unwrap_or_else(|| Device::new(target, None, BondState::None))
}

fn print_devices(devices: &[Device]) {
    println!("devices:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for (i, device) in devices.iter().enumerate() {
        let bonded = if device.is_bonded() { " [bonded]" } else { "" };
        println!("  {:>2}  {}  {}{}", i, device.address, device.display_name(), bonded);
    }
}

fn print_status(state: &CarState) {
    let snapshot = state.snapshot();
    println!(
        "bluetooth {} | scanning {} | pairing {:?} | connected {} | error {}",
        if snapshot.bluetooth_enabled { "on" } else { "off" },
        snapshot.is_scanning,
        snapshot.pairing_status,
        snapshot.is_connected,
        snapshot.last_error.as_deref().unwrap_or("-"),
    );
}

/// Print every change of the cells an operator cares about
fn watch_state(state: &Arc<CarState>) {
    let mut devices = state.devices.subscribe();
    tokio::spawn(async move {
        while let Some(list) = devices.recv().await {
            print_devices(&list);
        }
    });

    let mut pairing = state.pairing_status.subscribe();
    tokio::spawn(async move {
        while let Some(status) = pairing.recv().await {
            match status {
                PairingStatus::NeedsCredential => {
                    println!("pairing: every default PIN was rejected, enter one with `pin <pin>`")
                }
                status => println!("pairing: {:?}", status),
            }
        }
    });

    let mut connected = state.is_connected.subscribe();
    tokio::spawn(async move {
        while let Some(connected) = connected.recv().await {
            println!("connected: {}", connected);
        }
    });

    let mut errors = state.last_error.subscribe();
    tokio::spawn(async move {
        while let Some(error) = errors.recv().await {
            if let Some(error) = error {
                println!("error: {}", error);
            }
        }
    });
}

/// Returns false when the console should exit
async fn execute(service: &BluetoothService<SimulatedRadio>, command: ConsoleCommand) -> bool {
    let state = service.state();
    match command {
        ConsoleCommand::Scan => {
            if !service.start_discovery().await {
                println!("discovery not started");
            }
        }
        ConsoleCommand::StopScan => service.stop_discovery().await,
        ConsoleCommand::Bonded => {
            service.load_bonded_devices().await;
        }
        ConsoleCommand::ShowAll(all) => service.set_hide_unnamed(!all),
        ConsoleCommand::Pair(target) => {
            let device = resolve_device(&state, &target);
            service.pair(device).await;
        }
        ConsoleCommand::Pin(pin) => {
            if !service.provide_credential(&pin).await {
                println!("no pairing attempt is waiting for a PIN");
            }
        }
        ConsoleCommand::Reset => {
            if !service.reset_pairing().await {
                println!("pairing is still in progress");
            }
        }
        ConsoleCommand::Connect(target) => {
            let device = resolve_device(&state, &target);
            service.connect(&device.address).await;
        }
        ConsoleCommand::Disconnect => {
            service.disconnect().await;
        }
        ConsoleCommand::ClearError => service.clear_error(),
        ConsoleCommand::Send(command) => {
            if !service.send(command).await {
                println!("{} not sent", command);
            }
        }
        ConsoleCommand::Hold(direction) => service.start_moving(direction).await,
        ConsoleCommand::Release => {
            service.stop_moving().await;
        }
        ConsoleCommand::Horn(true) => service.start_horn().await,
        ConsoleCommand::Horn(false) => {
            service.stop_horn().await;
        }
        ConsoleCommand::FrontLight(on) => {
            service.set_front_light(on).await;
        }
        ConsoleCommand::BackLight(on) => {
            service.set_back_light(on).await;
        }
        ConsoleCommand::Say(phrase) => match service.handle_phrase(&phrase).await {
            Some(command) => println!("understood {:?}", command),
            None => println!("not understood"),
        },
        ConsoleCommand::Status => print_status(&state),
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Bluetooth car console");
    info!("Settings loaded from {:?}", settings_service.path());

    let service =
        BluetoothService::unrestricted(SimulatedRadio::demo(), settings_service.get().clone());
    watch_state(&service.state());
    service.load_bonded_devices().await;
    println!("{}", HELP);

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    // Interactive stdin gets its own thread so quitting never waits on a read
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ConsoleCommand>() {
                Ok(command) => {
                    if command_tx.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            }
        }
    });

    while let Some(command) = command_rx.recv().await {
        if !execute(&service, command).await {
            break;
        }
    }

    service.shutdown().await;
    if let Err(e) = settings_service.save() {
        warn!("Failed to save settings: {}", e);
    }
    info!("Bye");
    Ok(())
}
