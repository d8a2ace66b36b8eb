use fpbridge::{EnrollOptions, EnrollProgress, Enrollment, Error, FpBridge};
use serialport::{available_ports, open};
use std::{cell::RefCell, env, time::Duration};

mod pc_utils;
use pc_utils::{prompt, HostDelay, SerialReader, SerialWriter};

const DEFAULT_BAUD_RATE: u32 = 9600;

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => print_ports(),
        3 => enroll_to_slot(args[1].as_str(), args[2].parse::<u8>().unwrap()),
        _ => panic!("Usage: pc_enroll [port_name] [slot]"),
    };
}

fn print_ports() {
    let ports = available_ports().unwrap();
    for port in ports {
        println!("Available port: {} ({:#?})", port.port_name, port.port_type);
    }
}

fn enroll_to_slot(port_name: &str, slot: u8) {
    println!("Using port {}", port_name);
    let mut port = open(port_name).unwrap();
    port.set_baud_rate(DEFAULT_BAUD_RATE).unwrap();
    port.set_timeout(Duration::from_millis(10)).unwrap();

    let port_cell = RefCell::new(port);
    let reader = SerialReader(&port_cell);
    let writer = SerialWriter(&port_cell);
    let mut bridge = FpBridge::new(writer, reader, HostDelay);

    println!("1. Initializing sensor (this waits out the bridge reset)...");
    match bridge.initialize() {
        Ok(()) => match bridge.capacity() {
            Some(cap) => println!("Sensor ready, capacity {}", cap),
            None => println!("Sensor ready"),
        },
        Err(e) => panic!("Init failed: {:#?}", e),
    }

    let download = prompt("Download the template to the PC afterwards? (y/N): ") == "y";
    let options = EnrollOptions {
        download_template: download,
        store_in_module: true,
    };

    println!("2. Enrolling slot {}", slot);
    let mut enrollment = Enrollment::new(slot, options).unwrap();
    loop {
        match enrollment.step(&mut bridge) {
            Ok(EnrollProgress::PlaceFinger) => {
                prompt("Place your finger on the sensor and press Enter...");
            }
            Ok(EnrollProgress::RemoveFinger) => {
                prompt("Lift your finger off the sensor and press Enter...");
            }
            Ok(EnrollProgress::PlaceSameFinger) => {
                prompt("Place the SAME finger again and press Enter...");
            }
            Ok(EnrollProgress::Working) => {}
            Ok(EnrollProgress::TemplateReady) => {
                let template = enrollment.template().unwrap();
                println!(
                    "Template downloaded: {} bytes (skipped {} stray messages)",
                    template.len(),
                    enrollment.skipped_messages()
                );
                // Hand (slot, template) to whatever stores templates here.
            }
            Ok(EnrollProgress::Done) => {
                println!("Enrolled slot {}!", slot);
                break;
            }
            Err(Error::EnrollMismatch) => {
                println!("The two captures did not match. Try again.");
                break;
            }
            Err(e) => {
                println!("Enrollment failed: {:#?}", e);
                break;
            }
        }
    }
}
