//! End-to-end G5 action scenarios against the simulated device.

use g5prog::g5::{DeviceIdentity, G5Engine};
use g5prog::image::testutil::ImageBuilder;
use g5prog::image::Block;
use g5prog::probe::mock::MockDevice;
use g5prog::{
    run_with_driver, Action, ActionReport, DatImage, Error, JtagDriver, Progress, RunOptions,
};

fn execute(
    mock: MockDevice,
    data: Vec<u8>,
    action: Action,
) -> (Result<ActionReport, Error>, MockDevice) {
    let mut image = DatImage::from_bytes(data);
    let mut jtag = JtagDriver::new(mock);
    let result = run_with_driver(
        &mut jtag,
        &mut image,
        action,
        &RunOptions::default(),
        &Progress::none(),
    );
    (result, jtag.into_probe())
}

/// Assert that `expected` appears as an ordered subsequence of `trace`.
fn assert_subsequence(trace: &[u8], expected: &[u8]) {
    let mut iter = trace.iter();
    for &wanted in expected {
        assert!(
            iter.any(|&ir| ir == wanted),
            "missing {wanted:#04x} (in order) in trace {trace:02x?}"
        );
    }
}

#[test]
fn read_idcode_happy_path() {
    let data = ImageBuilder::default().build();
    let (result, mock) = execute(MockDevice::new(), data, Action::ReadIdcode);

    match result.unwrap() {
        ActionReport::Idcode(id) => {
            assert_eq!(id.raw(), 0x0f81_11cf);
            assert_eq!(id.revision(), 0x0);
        }
        other => panic!("unexpected report {other:?}"),
    }

    // The very first DR scan is the 32-bit IDCODE capture.
    assert_eq!(mock.scans[0].ir, 0x0f);
    assert_eq!(mock.scans[0].bits, 32);
    // The ready poll and the exit sequence both use ISC_NOOP; EXTEST2 runs
    // on the way out.
    assert_subsequence(&mock.instruction_trace(), &[0x0f, 0x0d, 0x09, 0x0d]);
}

#[test]
fn program_with_upk1_unlock() {
    let mut mock = MockDevice::new();
    mock.security[0][7] = 0x02; // UPK1 required

    let datastream: Vec<u8> = (0..32u32).map(|i| (i * 3 + 1) as u8).collect();
    let mut builder = ImageBuilder::default();
    builder.bsr_bits = 16;
    let data = builder
        .block(Block::BsrPattern.id(), vec![0xa5, 0x5a])
        .block(Block::Upk1.id(), vec![0x11; 32])
        .block_counts(&[2])
        .block(Block::DataStream.id(), datastream.clone())
        .build();

    let (result, mock) = execute(mock, data, Action::Program);
    assert!(matches!(result.unwrap(), ActionReport::None));

    // Security query, UPK1 unlock, BSR load, ISC enable, mode select, frame
    // data, then the exit path.
    assert_subsequence(
        &mock.instruction_trace(),
        &[0xb8, 0xeb, 0xec, 0xa8, 0x01, 0x0b, 0xae, 0xee, 0x0c, 0x09],
    );

    // The first frame and the overlapped second frame carry the datastream.
    let frames: Vec<_> = mock
        .scans
        .iter()
        .filter(|scan| scan.ir == 0xee && scan.bits == 128)
        .collect();
    assert_eq!(frames.len(), 3); // frame 0, shift-and-poll frame 1, final poll
    assert_eq!(frames[0].data, datastream[..16]);
    assert_eq!(frames[1].data, datastream[16..32]);

    // The BSR pattern went out through ISC_SAMPLE.
    let bsr = mock
        .scans
        .iter()
        .find(|scan| scan.ir == 0x01 && scan.bits == 16)
        .expect("BSR load scan");
    assert_eq!(bsr.data, [0xa5, 0x5a]);
}

#[test]
fn read_idcode_does_not_hold_the_device_against_the_image() {
    // The loaded image targets a different part; display-only actions must
    // still run.
    let mut builder = ImageBuilder::default();
    builder.device_id = 0x0f81_21cf;
    let (result, _) = execute(MockDevice::new(), builder.build(), Action::ReadIdcode);
    match result.unwrap() {
        ActionReport::Idcode(id) => assert_eq!(id.raw(), 0x0f81_11cf),
        other => panic!("unexpected report {other:?}"),
    }
}

#[test]
fn zeroize_runs_without_image_validation() {
    // Zeroizing a device must not depend on the image matching it, nor on
    // the ES/production exception gate.
    let mut builder = ImageBuilder::default();
    builder.device_id = 0x0f81_21cf;
    builder.exception = 11;
    let (result, mock) = execute(MockDevice::new(), builder.build(), Action::ZeroizeLikeNew);
    match result.unwrap() {
        ActionReport::Zeroization(cert) => assert_eq!(cert.0.len(), 131),
        other => panic!("unexpected report {other:?}"),
    }
    let mode_scan = mock
        .scans
        .iter()
        .find(|scan| scan.ir == 0xe6 && scan.data.iter().any(|&b| b != 0))
        .expect("zeroize challenge scan");
    assert_eq!(mode_scan.data[0], 1);
}

#[test]
fn verify_digest_aborts_when_external_check_is_disabled() {
    let mut mock = MockDevice::new();
    mock.security[0][1] = 0x04; // external digest check disabled

    let data = ImageBuilder::default()
        .block(Block::DataStream.id(), vec![0; 16])
        .block_counts(&[1])
        .build();
    let (result, mock) = execute(mock, data, Action::VerifyDigest);

    let err = result.unwrap_err();
    assert!(matches!(err, Error::VerifyDigest { .. }));
    assert_eq!(err.exit_code(), 60);
    // CHECK_DIGESTS must never have been issued.
    assert!(!mock.ir_trace.contains(&0xbc));
}

#[test]
fn verify_fails_on_fabric_array_fault() {
    let mut mock = MockDevice::new();
    // Every Capture-DR on FRAME_DATA consumes one canned response, including
    // the capture during the first frame write; the fault lands on the first
    // real status poll. The status register then classifies it as a
    // fabric-array verify failure.
    let mut fault = [0u8; 16];
    fault[0] = 0x08;
    mock.frame_data.push_back([0u8; 16]);
    mock.frame_data.push_back(fault);
    let mut status = [0u8; 8];
    status[0] = 0x04;
    status[1] = 128;
    mock.frame_status.push_back(status);

    let datastream: Vec<u8> = vec![0x22; 32];
    let data = ImageBuilder::default()
        .block_counts(&[2])
        .block(Block::DataStream.id(), datastream)
        .build();
    let (result, mock) = execute(mock, data, Action::Verify);

    let err = result.unwrap_err();
    assert_eq!(err.unique_exit_code(), Some(32773));
    assert!(matches!(err, Error::Verify { .. }));
    assert_eq!(err.exit_code(), 12);

    // First error wins: after the FRAME_STATUS readout no more frame data
    // goes out, only the diagnostics readback and the exit sequence.
    let trace = mock.instruction_trace();
    let status_at = trace.iter().position(|&ir| ir == 0xd8).unwrap();
    assert!(!trace[status_at..].contains(&0xee));
    assert_subsequence(&trace[status_at..], &[0xd8, 0x0c, 0x09]);
}

#[test]
fn zeroize_unrecoverable_unlocks_both_keys_and_reads_certificate() {
    let mut mock = MockDevice::new();
    mock.security[0][7] = 0x06; // UPK1 and UPK2 required

    let data = ImageBuilder::default()
        .block(Block::Upk1.id(), vec![0x11; 32])
        .block(Block::Upk2.id(), vec![0x22; 32])
        .build();
    let (result, mock) = execute(mock, data, Action::ZeroizeUnrecoverable);

    let cert = match result.unwrap() {
        ActionReport::Zeroization(cert) => cert,
        other => panic!("unexpected report {other:?}"),
    };
    assert_eq!(cert.0.len(), 131);
    assert!(cert.0.iter().all(|&byte| byte == 0x5a));

    assert_subsequence(
        &mock.instruction_trace(),
        &[0xb8, 0xeb, 0xec, 0xa8, 0xeb, 0xec, 0xaa, 0xe6, 0xe2, 0xf2],
    );

    // Mode 3 plus the fixed 15-byte challenge.
    let zeroize = mock
        .scans
        .iter()
        .find(|scan| scan.ir == 0xe6 && scan.data.iter().any(|&b| b != 0))
        .expect("zeroize challenge scan");
    assert_eq!(zeroize.bits, 128);
    assert_eq!(zeroize.data[0], 3);
    assert_eq!(
        zeroize.data[1..16],
        [0xb6, 0x16, 0x3b, 0x25, 0xc3, 0x0a, 0xe5, 0x7b, 0x5d, 0x19, 0x00, 0x45, 0x06, 0x31, 0xa8]
    );
}

#[test]
fn device_info_collects_every_register() {
    let mut mock = MockDevice::new();
    mock.fsn = [0x42; 16];
    mock.ir_capture = 0x81; // core enabled

    let data = ImageBuilder::default().build();
    let (result, mock) = execute(mock, data, Action::DeviceInfo);
    let info = match result.unwrap() {
        ActionReport::DeviceInfo(info) => info,
        other => panic!("unexpected report {other:?}"),
    };

    assert_eq!(info.core_enabled, Some(true));
    assert_eq!(info.serial_number, [0x42; 16]);
    assert_eq!(info.digests.iter().count(), 13);
    // G5 (family 0x07) devices also expose their integrity bits.
    assert!(info.integrity_bits.is_some());
    assert_subsequence(
        &mock.instruction_trace(),
        &[0xcd, 0x0d, 0xa6, 0xa3, 0xe7, 0xf0, 0xe3, 0xb8, 0xe1],
    );
}

#[test]
fn read_device_certificate_returns_the_full_buffer() {
    let data = ImageBuilder::default().build();
    let (result, _) = execute(MockDevice::new(), data, Action::ReadDeviceCertificate);
    match result.unwrap() {
        ActionReport::DeviceCertificate(cert) => {
            assert!(!cert.validated);
            assert_eq!(cert.data.unwrap().len(), 1024);
        }
        other => panic!("unexpected report {other:?}"),
    }
}

#[test]
fn unsupported_action_is_rejected_before_any_protocol_traffic() {
    let data = ImageBuilder::default().build();
    let (result, mock) = execute(MockDevice::new(), data, Action::ValidateUserEncKeys);

    let err = result.unwrap_err();
    assert!(matches!(err, Error::ActionNotSupported { .. }));
    assert_eq!(err.exit_code(), 151);
    // Identification reads the IDCODE; nothing else reaches the device.
    assert_eq!(mock.instruction_trace(), vec![0x0f]);
}

#[test]
fn corrupted_image_stops_before_initialization() {
    let mut data = ImageBuilder::default()
        .block(Block::DataStream.id(), vec![0x33; 32])
        .block_counts(&[2])
        .build();
    let len = data.len();
    data[len - 10] ^= 0xff;

    let (result, mock) = execute(MockDevice::new(), data, Action::Program);
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 100);
    // Programming mode was never entered.
    assert!(!mock.ir_trace.contains(&0x0b));
}

#[test]
fn mismatched_idcode_is_rejected() {
    let mut builder = ImageBuilder::default();
    builder.device_id = 0x0f81_21cf; // different part number
    let data = builder.build();

    let (result, _) = execute(MockDevice::new(), data, Action::Program);
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 6);
    assert_eq!(err.unique_exit_code(), Some(32772));
}

#[test]
fn es_image_is_rejected_on_production_silicon() {
    let mut mock = MockDevice::new();
    mock.idcode = 0x5f81_11cf; // revision 5 silicon
    let mut builder = ImageBuilder::default();
    builder.device_id = 0x5f81_11cf;
    builder.exception = 11; // ES programming file
    let data = builder.build();

    let (result, _) = execute(mock, data, Action::Program);
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 6);
    assert_eq!(err.unique_exit_code(), Some(32857));
}

#[test]
fn busy_device_times_out_with_poll_error() {
    let mut mock = MockDevice::new();
    mock.busy_polls = u32::MAX;

    let mut image = DatImage::from_bytes(ImageBuilder::default().build());
    let mut jtag = JtagDriver::new(mock);
    let progress = Progress::none();
    let device = DeviceIdentity {
        idcode: 0x0f81_11cf,
        revision: 0,
        family: 0x07,
        exception: 0,
    };
    let mut engine = G5Engine::new(&mut jtag, &mut image, &progress, Action::Program, device);
    engine.set_poll_limits(3, 3);
    let err = engine.run().unwrap_err();

    assert_eq!(err.exit_code(), 7);
    assert_eq!(err.unique_exit_code(), Some(32818));
}
