use std::cell::RefCell;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use g5prog::{
    Action, ActionReport, DatImage, GpioProbe, Operation, Progress, ProgressEvent, RunOptions,
};

const ACTION_HELP: &str = "\
Available actions:
    program                 - Erase, program and verify the blocks in the image
    erase                   - Erase the blocks supported by the image
    verify                  - Verify device contents against the image
    read_idcode             - Read and display the IDCODE register
    device_info             - Display design information and security settings
    enc_data_authentication - Authenticate the encrypted bitstream without programming
    verify_digest           - Compare on-device digests against authoritative values
    validate_user_enc_keys  - Validate user encryption keys
    read_device_certificate - Read and display the device certificate
    zeroize_like_new        - Zeroize; the device stays recoverable
    zeroize_unrecoverable   - Zeroize; the device cannot be re-enrolled
    spi_flash_read_idcode   - Read the 3-byte SPI-flash JEDEC id
    spi_flash_read          - Read SPI-flash contents (can be very slow)
    spi_flash_erase         - Erase the entire SPI flash
    spi_flash_erase_image   - Erase only the sectors covered by the image
    spi_flash_program       - Erase the image region, then program the image
    spi_flash_verify        - Verify the SPI flash against the image
    spi_flash_blank_check   - Check that the whole SPI flash reads 0xFF";

fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(
    name = "g5prog",
    about = "Program, verify and interrogate G5-family FPGAs over GPIO-bit-banged JTAG",
    after_help = ACTION_HELP
)]
struct Cli {
    /// Action to perform (case-insensitive)
    #[arg(short = 'a', long = "action")]
    action: Action,

    /// Programming image (DAT file)
    file: Option<PathBuf>,

    /// SPI-flash byte address for image operations (decimal or 0x-prefixed)
    #[arg(long, default_value = "0", value_parser = parse_address)]
    spi_address: u64,
}

fn operation_label(operation: Operation) -> &'static str {
    match operation {
        Operation::CrcCheck => "crc check",
        Operation::Erase => "erase",
        Operation::Program => "program",
        Operation::Verify => "verify",
        Operation::Authenticate => "authenticate",
        Operation::SpiRead => "flash read",
        Operation::SpiErase => "flash erase",
        Operation::SpiProgram => "flash program",
        Operation::SpiVerify => "flash verify",
        Operation::SpiBlankCheck => "blank check",
    }
}

fn console_progress() -> Progress {
    let bar: RefCell<Option<ProgressBar>> = RefCell::new(None);
    Progress::new(move |event| match event {
        ProgressEvent::Started(operation) => {
            let new = ProgressBar::new(100);
            new.set_style(
                ProgressStyle::with_template("{msg:>13} [{wide_bar}] {pos:>3}%")
                    .expect("static template")
                    .progress_chars("=> "),
            );
            new.set_message(operation_label(operation));
            *bar.borrow_mut() = Some(new);
        }
        ProgressEvent::Percent(_, percent) => {
            if let Some(bar) = bar.borrow().as_ref() {
                bar.set_position(percent as u64);
            }
        }
        ProgressEvent::Component { index, total } => {
            if let Some(bar) = bar.borrow().as_ref() {
                bar.println(format!("processing component {index} of {total}"));
                bar.set_position(0);
            }
        }
        ProgressEvent::Finished(_) => {
            if let Some(bar) = bar.borrow_mut().take() {
                bar.finish_and_clear();
            }
        }
    })
}

fn hex_dump(data: &[u8]) {
    for line in data.chunks(16) {
        let bytes: Vec<String> = line.iter().map(|b| format!("{b:02X}")).collect();
        println!("{}", bytes.join(" "));
    }
}

fn print_report(report: &ActionReport) {
    match report {
        ActionReport::None => {}
        ActionReport::Idcode(id) => println!("IDCODE: {id}"),
        ActionReport::DeviceInfo(info) => println!("\nDevice info:\n{info}"),
        ActionReport::DeviceCertificate(cert) => println!("{cert}"),
        ActionReport::DigestCheck(check) => println!("{check}"),
        ActionReport::Zeroization(cert) => println!("{cert}"),
        ActionReport::SpiFlashId(id) => {
            println!("SPI-Flash IDCode (HEX) = {:02X} {:02X} {:02X}", id[0], id[1], id[2])
        }
        ActionReport::SpiData(data) => hex_dump(data),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(path) = cli.file else {
        eprintln!("Error: a programming image (DAT file) is required");
        return ExitCode::from(106);
    };
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Error: can't open file {}: {err}", path.display());
            return ExitCode::from(103);
        }
    };
    let mut data = Vec::new();
    if let Err(err) = file.read_to_end(&mut data) {
        eprintln!("Error reading file {}: {err}", path.display());
        return ExitCode::from(105);
    }
    let mut image = DatImage::from_bytes(data);

    let probe = match GpioProbe::autodetect() {
        Ok(probe) => probe,
        Err(err) => {
            eprintln!("Error: failed to open the JTAG GPIO lines: {err}");
            return ExitCode::from(170);
        }
    };

    let options = RunOptions {
        spi_target_address: cli.spi_address,
    };
    let progress = console_progress();

    let start = Instant::now();
    let result = g5prog::run(probe, &mut image, cli.action, &options, &progress);
    let elapsed = start.elapsed().as_secs();

    let status = match result {
        Ok(report) => {
            print_report(&report);
            println!("Exit code = 0... Success");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            if let Some(code) = err.unique_exit_code() {
                eprintln!("ERROR_CODE: {code:X}");
            }
            eprintln!("Error return code {}", err.exit_code());
            ExitCode::from(err.exit_code())
        }
    };

    println!(
        "Elapsed time = {:02}:{:02}:{:02}",
        elapsed / 3600,
        (elapsed % 3600) / 60,
        elapsed % 60
    );
    status
}
