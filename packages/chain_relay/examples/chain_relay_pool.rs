//! Shows how owner locks keep a pooled instance out of circulation after it has been freed.

use chain_relay::{ObjectPool, Poolable};

#[derive(Default)]
struct Frame {
    bytes: Vec<u8>,
}

impl Poolable for Frame {
    fn reset(&mut self) {
        self.bytes.clear();
    }
}

fn main() {
    let pool = ObjectPool::builder().idle_limit(8).build();
    pool.register::<Frame>();
    pool.prewarm::<Frame>(2).expect("Frame is registered");

    let frame = pool.allocate::<Frame>().expect("Frame is registered");
    frame.borrow_mut().bytes.extend_from_slice(b"hello");

    // Someone else still needs the frame after we are done with it.
    let renderer = pool.new_lock_key();
    pool.lock(&frame, renderer).expect("frame is checked out");
    pool.free(frame.clone()).expect("Frame is registered");

    let other = pool.allocate::<Frame>().expect("Frame is registered");
    println!(
        "while locked: reused = {}, frame still holds {:?}",
        other.ptr_eq(&frame),
        String::from_utf8_lossy(&frame.borrow().bytes)
    );

    pool.unlock(&frame, renderer).expect("Frame is registered");
    pool.free(other).expect("Frame is registered");

    println!(
        "constructed {} frames, {} idle",
        pool.constructed_count::<Frame>(),
        pool.idle_count::<Frame>()
    );
}
