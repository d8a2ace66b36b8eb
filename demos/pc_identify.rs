use fpbridge::{FpBridge, Identification, IdentifyOutcome, IdentifyProgress};
use serialport::{available_ports, open};
use std::{cell::RefCell, env, time::Duration};

mod pc_utils;
use pc_utils::{prompt, HostDelay, SerialReader, SerialWriter};

const DEFAULT_BAUD_RATE: u32 = 9600;

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => print_ports(),
        2 => identify(args[1].as_str()),
        _ => panic!("Usage: pc_identify [port_name]"),
    };
}

fn print_ports() {
    let ports = available_ports().unwrap();
    for port in ports {
        println!("Available port: {} ({:#?})", port.port_name, port.port_type);
    }
}

fn identify(port_name: &str) {
    println!("Using port {}", port_name);
    let mut port = open(port_name).unwrap();
    port.set_baud_rate(DEFAULT_BAUD_RATE).unwrap();
    port.set_timeout(Duration::from_millis(10)).unwrap();

    let port_cell = RefCell::new(port);
    let reader = SerialReader(&port_cell);
    let writer = SerialWriter(&port_cell);
    let mut bridge = FpBridge::new(writer, reader, HostDelay);

    println!("1. Initializing sensor...");
    if let Err(e) = bridge.initialize() {
        panic!("Init failed: {:#?}", e);
    }

    println!("2. Stored templates: {:?}", bridge.template_count());

    println!("3. Identifying...");
    let mut identification = Identification::new();
    loop {
        match identification.step(&mut bridge) {
            Ok(IdentifyProgress::PlaceFinger) => {
                prompt("Place your finger on the sensor and press Enter...");
            }
            Ok(IdentifyProgress::Working) => {}
            Ok(IdentifyProgress::Done(outcome)) => {
                match outcome {
                    IdentifyOutcome::Match { slot, confidence } => {
                        println!("Found! Slot {}, confidence {}", slot, confidence)
                    }
                    IdentifyOutcome::MatchGarbled(raw) => {
                        println!("Found, but the reply was garbled: {}", raw)
                    }
                    IdentifyOutcome::NoMatch => println!("No match in the sensor database."),
                    IdentifyOutcome::Unrecognized(raw) => {
                        println!("Unexpected search reply: {}", raw)
                    }
                }
                break;
            }
            Err(e) => {
                println!("Identification failed: {:#?}", e);
                break;
            }
        }
    }
}
