#![no_main]
use atlterm::ipc::{FrameDecoder, OutputMessage, Request};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Split the input so frames straddle feed boundaries.
    let mid = data.first().map_or(0, |&b| b as usize % (data.len() + 1));
    let (head, tail) = data.split_at(mid);

    let mut requests = FrameDecoder::new();
    requests.feed(head);
    let _: Vec<Request> = requests.drain_frames();
    requests.feed(tail);
    let _: Vec<Request> = requests.drain_frames();

    let mut output = FrameDecoder::new();
    output.feed(data);
    while let Some(frame) = output.next_frame::<OutputMessage>() {
        let _ = frame;
    }
});
