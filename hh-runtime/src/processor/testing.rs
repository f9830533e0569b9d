//! Fixtures shared by the processor tests.

use {
    super::*,
    crate::{
        config::DEFAULT_CHUNK_SIZE,
        heap::{Level, SystemChunkPool},
    },
};

/// Create a table of processors sharing one pool.
///
/// The pool holds at most `capacity` granules, if given.
pub fn setup(processors: usize, capacity: Option<usize>)
    -> (Arc<SystemChunkPool>, Arc<ProcessorTable>, Vec<Processor>)
{
    let granule = SystemChunkPool::new().granule();
    let pool = Arc::new(SystemChunkPool::with_capacity(
        capacity.map(|granules| granules * granule),
    ));

    let config = RuntimeConfig{processors, ..RuntimeConfig::default()};
    let table = ProcessorTable::new(config, None);

    let processors = (0 .. processors)
        .map(|number| Processor::new(&table, number, pool.clone()))
        .collect();

    (pool, table, processors)
}

/// Create a thread that allocates into a fresh level 0 chunk.
pub fn local_thread(processor: &Processor) -> ThreadHandle
{
    let mut heap = HierarchicalHeap::new(processor.pool().clone());
    let chunk = heap.as_mut().extend(0, DEFAULT_CHUNK_SIZE).unwrap();
    processor.new_thread(ThreadState{
        heap_mode: HeapMode::Local,
        current_chunk: Some(chunk),
        heap: Some(heap),
        stack_reserved: 1 << 10,
        ..ThreadState::default()
    })
}

/// Collector that records its requests,
/// and optionally frees levels of the running thread.
#[derive(Default)]
pub struct TestCollector
{
    pub requests: Vec<CollectRequest>,
    pub free_min_level: Option<Level>,
}

impl Collector for TestCollector
{
    fn collect(&mut self, processor: &mut Processor, request: CollectRequest)
        -> Result<(), AllocError>
    {
        self.requests.push(request);

        if let (Some(min_level), Some(thread)) =
            (self.free_min_level, processor.current_thread())
        {
            if let Some(heap) = thread.state().heap.as_mut() {
                heap.as_mut().free_levels(min_level);
            }
        }

        Ok(())
    }
}
