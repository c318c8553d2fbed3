use std::sync::Arc;
use std::thread;

use hfp_bridge::aec::{
    AecStatus, EchoCancellation, RenderFifo, AEC_FIFO_CAPACITY, AEC_FRAME_SAMPLES,
};
use hfp_bridge::config::AecSettings;

#[test]
fn fifo_round_trip_and_underflow() {
    let mut fifo = RenderFifo::new(AEC_FIFO_CAPACITY);
    let samples: Vec<i16> = (0..200).collect();
    fifo.push(&samples);
    assert_eq!(fifo.pop(201), None);
    assert_eq!(fifo.len(), 200);
    assert_eq!(fifo.pop(200), Some(samples));
}

#[test]
fn fifo_keeps_latest_capacity_samples() {
    let mut fifo = RenderFifo::new(AEC_FIFO_CAPACITY);
    let total = AEC_FIFO_CAPACITY + 123;
    let samples: Vec<i16> = (0..total).map(|i| (i % 30_000) as i16).collect();
    for chunk in samples.chunks(48) {
        fifo.push(chunk);
    }
    assert_eq!(fifo.len(), AEC_FIFO_CAPACITY);
    assert_eq!(fifo.pop(AEC_FIFO_CAPACITY), Some(samples[123..].to_vec()));
}

#[test]
fn concurrent_push_and_cancel() {
    let aec = Arc::new(EchoCancellation::new(&AecSettings {
        force_disable: false,
        ..AecSettings::default()
    }));
    assert_eq!(aec.init(), AecStatus::Active);

    let producer = {
        let aec = aec.clone();
        thread::spawn(move || {
            for i in 0..500 {
                aec.push_render(&[(i % 100) as i16; 24]);
            }
        })
    };
    for _ in 0..100 {
        let mut frame = [10i16; AEC_FRAME_SAMPLES];
        aec.cancel(&mut frame);
    }
    producer.join().unwrap();
    assert!(aec.buffered_reference() <= AEC_FIFO_CAPACITY);

    aec.shutdown();
    assert!(!aec.is_enabled());
    assert_eq!(aec.buffered_reference(), 0);
}
