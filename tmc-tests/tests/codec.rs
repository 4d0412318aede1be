use std::io::Read;

use bytes::BytesMut;
use tmc_protocol::{Anomaly, codec::BlockCodec};
use tmc_sync::{
    Transport,
    engine::{Builder, SyncEngine},
};
use tmc_tests::SimulatedInstrument;
use tokio_util::codec::Decoder;

/// Reads `responses` complete response messages, seven bytes at a time.
fn drain(engine: &mut SyncEngine<SimulatedInstrument>, responses: usize) -> Vec<Vec<u8>> {
    let transport = engine.transport_mut();
    let mut reads = Vec::new();
    let mut buf = [0u8; 7];
    for _ in 0..responses {
        loop {
            let n = transport.read(&mut buf).unwrap();
            reads.push(buf[..n].to_vec());
            if transport.end_of_message().unwrap() {
                break;
            }
        }
    }
    reads
}

#[test]
fn frames_blocks_from_chunked_stream() {
    let _ = env_logger::builder().is_test(true).try_init();
    let first: Vec<u8> = (0u8..40).collect();
    let second = b"waveform\n#1 data".to_vec();
    let instrument = SimulatedInstrument::new()
        .respond_block(":WAV:DATA? 1", &first)
        .respond_block(":WAV:DATA? 2", &second)
        .read_chunk(7);
    let mut engine = Builder::new().build(instrument);
    engine.send(b":WAV:DATA? 1\n:WAV:DATA? 2\n").unwrap();

    let mut codec = BlockCodec::default();
    let mut src = BytesMut::new();
    let mut blocks = Vec::new();
    for chunk in drain(&mut engine, 2) {
        src.extend_from_slice(&chunk);
        while let Some(block) = codec.decode(&mut src).unwrap() {
            blocks.push(block);
        }
    }
    if let Some(block) = codec.decode_eof(&mut src).unwrap() {
        blocks.push(block);
    }

    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].payload(), first.as_slice());
    assert_eq!(blocks[1].payload(), second.as_slice());
    assert!(blocks.iter().all(|block| block.is_terminated()));
    assert!(src.is_empty());
}

#[test]
fn unterminated_block_at_end_of_stream() {
    let mut codec = BlockCodec::default();
    let mut src = BytesMut::from(&b"#15hello"[..]);
    assert!(codec.decode(&mut src).unwrap().is_none());
    let block = codec.decode_eof(&mut src).unwrap().unwrap();
    assert_eq!(block.payload(), b"hello");
    assert_eq!(
        block.anomaly(),
        Some(&Anomaly::MissingTerminator { found: None })
    );
}
