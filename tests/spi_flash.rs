//! SPI-flash subsystem scenarios against the simulated flash.

use pretty_assertions::assert_eq;

use g5prog::probe::mock::{MockDevice, SpiFlashSim};
use g5prog::{
    run_with_driver, Action, ActionReport, DatImage, Error, JtagDriver, Progress, RunOptions,
};

fn execute(
    mock: MockDevice,
    file: Vec<u8>,
    action: Action,
    spi_target_address: u64,
) -> (Result<ActionReport, Error>, MockDevice) {
    let mut image = DatImage::from_bytes(file);
    let mut jtag = JtagDriver::new(mock);
    let options = RunOptions { spi_target_address };
    let result = run_with_driver(&mut jtag, &mut image, action, &options, &Progress::none());
    (result, jtag.into_probe())
}

fn with_flash() -> MockDevice {
    let mut mock = MockDevice::new();
    mock.spi = Some(SpiFlashSim::s25f_128mb());
    mock
}

#[test]
fn read_id_reports_the_jedec_triple() {
    let (result, mock) = execute(with_flash(), vec![0; 16], Action::SpiFlashReadId, 0);
    match result.unwrap() {
        ActionReport::SpiFlashId(id) => assert_eq!(id, [0x01, 0x20, 0x18]),
        other => panic!("unexpected report {other:?}"),
    }
    // read_idcode skips the reset/status preamble entirely.
    let spi = mock.spi.unwrap();
    assert_eq!(spi.commands.len(), 1);
    assert_eq!(spi.commands[0].cmd, 0x9f);
}

#[test]
fn program_aligns_to_page_boundaries() {
    let file: Vec<u8> = (0..0x300u32).map(|i| i as u8).collect();
    let target = 0x0001_00f0;
    let (result, mock) = execute(with_flash(), file.clone(), Action::SpiFlashProgram, target);
    result.unwrap();

    let spi = mock.spi.unwrap();

    // One sector erase covers the whole image span, issued at the (not
    // sector-aligned) target address.
    let erases: Vec<_> = spi.commands.iter().filter(|c| c.cmd == 0xd8).collect();
    assert_eq!(erases.len(), 1);
    assert_eq!(erases[0].addr, Some(0x0001_00f0));

    // Page programs: a short head write up to the page boundary, then full
    // pages, then the tail.
    let programs: Vec<_> = spi.commands.iter().filter(|c| c.cmd == 0x02).collect();
    let layout: Vec<(u64, usize)> = programs
        .iter()
        .map(|c| (c.addr.unwrap(), c.data.len()))
        .collect();
    assert_eq!(
        layout,
        vec![
            (0x0001_00f0, 16),
            (0x0001_0100, 256),
            (0x0001_0200, 256),
            (0x0001_0300, 240),
        ]
    );

    // Write-enable precedes every page program.
    let mut previous_was_wren = false;
    for command in &spi.commands {
        if command.cmd == 0x02 {
            assert!(previous_was_wren, "page program without write enable");
        }
        previous_was_wren = command.cmd == 0x06;
    }

    // The programmed bytes match the image.
    for (i, &byte) in file.iter().enumerate() {
        assert_eq!(spi.read_byte(target + i as u64), byte, "byte {i}");
    }
}

#[test]
fn read_returns_flash_contents() {
    let mut mock = with_flash();
    let pattern: Vec<u8> = (0..64u32).map(|i| (0xf0 - i) as u8).collect();
    {
        let spi = mock.spi.as_mut().unwrap();
        for (i, &byte) in pattern.iter().enumerate() {
            spi.memory.insert(i as u64, byte);
        }
    }
    let (result, _) = execute(mock, vec![0u8; 64], Action::SpiFlashRead, 0);
    match result.unwrap() {
        ActionReport::SpiData(data) => assert_eq!(data, pattern),
        other => panic!("unexpected report {other:?}"),
    }
}

#[test]
fn verify_reports_the_first_mismatch() {
    let file: Vec<u8> = vec![0xaa; 256];
    let mut mock = with_flash();
    {
        let spi = mock.spi.as_mut().unwrap();
        for i in 0..256u64 {
            spi.memory.insert(i, 0xaa);
        }
        spi.memory.insert(100, 0xab);
    }
    let (result, _) = execute(mock, file, Action::SpiFlashVerify, 0);
    match result.unwrap_err() {
        Error::SpiFlashVerify {
            address,
            expected,
            actual,
        } => {
            assert_eq!(address, 100);
            assert_eq!(expected, 0xaa);
            assert_eq!(actual, 0xab);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn blank_check_reports_the_first_unerased_byte() {
    let mut mock = with_flash();
    mock.spi.as_mut().unwrap().memory.insert(5, 0x12);
    let (result, _) = execute(mock, vec![0u8; 16], Action::SpiFlashBlankCheck, 0);
    match result.unwrap_err() {
        Error::SpiFlashBlankCheck { address, value } => {
            assert_eq!(address, 5);
            assert_eq!(value, 0x12);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn die_erase_checks_the_error_bit() {
    let mut mock = with_flash();
    mock.spi.as_mut().unwrap().status = 0x20; // erase-error latched
    let (result, _) = execute(mock, vec![0u8; 16], Action::SpiFlashErase, 0);
    let err = result.unwrap_err();
    assert!(matches!(err, Error::SpiFlashErase));
    assert_eq!(err.exit_code(), 202);
}

#[test]
fn oversized_image_is_rejected() {
    let (result, _) = execute(
        with_flash(),
        vec![0u8; 64],
        Action::SpiFlashProgram,
        0x0100_0000 - 10,
    );
    let err = result.unwrap_err();
    assert!(matches!(err, Error::ImageSize { .. }));
    assert_eq!(err.exit_code(), 209);
}

#[test]
fn unknown_flash_vendor_is_rejected() {
    let mut mock = MockDevice::new();
    mock.spi = Some(SpiFlashSim::new([0xc2, 0x20, 0x18], 3));
    let (result, _) = execute(mock, vec![0u8; 16], Action::SpiFlashRead, 0);
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 6);
}

#[test]
fn non_g5_chain_is_rejected_for_spi_actions() {
    let mut mock = with_flash();
    mock.idcode = 0x4ba0_0477; // some other device
    let (result, _) = execute(mock, vec![0u8; 16], Action::SpiFlashReadId, 0);
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 6);
}
