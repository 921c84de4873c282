#![no_main]

use heapsift::allocations::{ChunkHeapSource, HeapRegion};
use heapsift::graph::{RootContents, RootKind, RootSet};
use heapsift::session::Session;
use heapsift::snapshot::{MemoryImage, PermissionClass};
use libfuzzer_sys::fuzz_target;

const HEAP: u64 = 0x10000;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a chunk heap; every setup phase must survive them
    let len = (data.len() as u64) & !0xf;
    if len == 0 {
        return;
    }
    let mut image = MemoryImage::new();
    if image
        .map(HEAP, data[..len as usize].to_vec(), PermissionClass::Writable)
        .is_err()
    {
        return;
    }
    let mut roots = RootSet::new();
    roots.push(
        RootKind::Module {
            name: "fuzz".to_string(),
        },
        RootContents::Range {
            start: HEAP,
            end: HEAP + len.min(64),
        },
    );
    let region = HeapRegion {
        base: HEAP,
        limit: HEAP + len,
        max_size: 0,
    };
    let session = Session::builder(Box::new(image))
        .source(Box::new(ChunkHeapSource::new("fuzz", vec![region])))
        .roots(roots)
        .build();
    for index in 0..session.finder().count() as u32 {
        let _ = session.explain(index);
        let _ = session.is_unreferenced(index);
    }
});
