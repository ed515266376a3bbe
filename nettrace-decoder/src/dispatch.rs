use std::sync::Arc;

use nettrace_format::{EventDescriptor, Guid, PayloadView};
use tracing::debug;

use crate::instrument::DecodeHooks;
use crate::metadata::MetadataRegistry;
use crate::sorter::PendingEvent;

/// One decoded, fully materialized trace event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub provider_id: Guid,
    pub provider_name: String,
    pub event_id: u16,
    pub event_name: Option<String>,
    pub event_version: u8,
    pub level: u8,
    pub keywords: u64,
    pub opcode: u8,
    pub thread_id: u64,
    pub process_id: u32,
    pub processor_number: u32,
    pub timestamp: u64,
    pub activity_id: Guid,
    pub related_activity_id: Guid,
    pub payload: Vec<u8>,
    pub stack: Vec<u8>,
}

impl EventRecord {
    /// Decode the payload through the descriptor's parameter schema.
    pub fn payload_view<'a>(&'a self, descriptor: &'a EventDescriptor) -> PayloadView<'a> {
        PayloadView::new(descriptor, &self.payload)
    }
}

/// Downstream receiver of decoded events.
pub trait EventSink {
    fn on_event(&mut self, record: EventRecord);
}

impl<F: FnMut(EventRecord)> EventSink for F {
    fn on_event(&mut self, record: EventRecord) {
        self(record)
    }
}

/// Joins buffered events with their registered descriptors and hands the
/// result to the sink.
pub struct Dispatcher<S> {
    sink: S,
    hooks: Arc<dyn DecodeHooks>,
    process_id: u32,
    dispatched: u64,
    unknown_dropped: u64,
}

impl<S: EventSink> Dispatcher<S> {
    pub fn new(sink: S, hooks: Arc<dyn DecodeHooks>) -> Self {
        Dispatcher {
            sink,
            hooks,
            process_id: 0,
            dispatched: 0,
            unknown_dropped: 0,
        }
    }

    /// The trace-wide process id, known once the entry object is read.
    pub fn set_process_id(&mut self, process_id: u32) {
        self.process_id = process_id;
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Events referencing descriptors that were never registered. This is
    /// surviveable corruption: the event is dropped, the pass continues.
    pub fn unknown_dropped(&self) -> u64 {
        self.unknown_dropped
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn dispatch(&mut self, registry: &MetadataRegistry, event: PendingEvent) {
        let Some(descriptor) = registry.get(event.header.metadata_id) else {
            debug!(
                metadata_id = event.header.metadata_id,
                "dropping event with unregistered metadata id"
            );
            self.unknown_dropped += 1;
            return;
        };

        let record = EventRecord {
            provider_id: descriptor.provider_id,
            provider_name: descriptor.provider_name.clone(),
            event_id: descriptor.event_id,
            event_name: descriptor.event_name.clone(),
            event_version: descriptor.event_version,
            level: descriptor.level,
            keywords: descriptor.keywords,
            opcode: descriptor.opcode,
            thread_id: event.header.thread_id,
            process_id: self.process_id,
            processor_number: event.header.capture_processor_number,
            timestamp: event.header.timestamp,
            activity_id: event.header.activity_id,
            related_activity_id: event.header.related_activity_id,
            payload: event.payload,
            stack: event.stack,
        };

        self.hooks.start_dispatch();
        self.sink.on_event(record);
        self.hooks.stop_dispatch();
        self.dispatched += 1;
    }
}
