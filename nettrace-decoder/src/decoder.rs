use std::io::Read;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use nettrace_format::{ByteReader, FormatError, TraceParameters};
use tracing::debug;

use crate::block::{self, BlockKind};
use crate::dispatch::{Dispatcher, EventSink};
use crate::event::{EventParser, ParsedEvent};
use crate::instrument::{DecodeHooks, Instrumentation};
use crate::metadata::MetadataRegistry;
use crate::preamble;
use crate::sorter::{EventCache, PendingEvent};
use crate::stacks::StackCache;
use crate::stream::StreamReader;
use crate::Result;

/// Outcome of a completed decode pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeSummary {
    pub parameters: TraceParameters,
    pub events_dispatched: u64,
    /// Saturating count of events the stream declared but never delivered,
    /// including events dropped for referencing unregistered metadata.
    pub events_lost: i32,
}

/// Streaming decoder for one Nettrace/NetPerf trace.
///
/// Single-threaded and cooperative: one call to [`Decoder::process`] drives
/// the stream to completion, dispatching events to the sink in global
/// timestamp order. Any non-contained parse failure aborts the pass and
/// surfaces a single error.
pub struct Decoder<R, S> {
    reader: StreamReader<R>,
    registry: MetadataRegistry,
    stacks: StackCache,
    cache: EventCache,
    dispatcher: Dispatcher<S>,
}

impl<R: Read, S: EventSink> Decoder<R, S> {
    /// Instrumentation comes from the environment (see
    /// [`crate::instrument::INSTRUMENTATION_ENV`]).
    pub fn new(source: R, sink: S) -> Self {
        Decoder::with_hooks(source, sink, Instrumentation::hooks_from_env())
    }

    pub fn with_hooks(source: R, sink: S, hooks: Arc<dyn DecodeHooks>) -> Self {
        Decoder {
            reader: StreamReader::with_hooks(source, hooks.clone()),
            registry: MetadataRegistry::new(),
            stacks: StackCache::new(),
            cache: EventCache::new(),
            dispatcher: Dispatcher::new(sink, hooks),
        }
    }

    /// Drive the stream to completion.
    pub fn process(mut self) -> Result<DecodeSummary> {
        let is_nettrace = preamble::probe_magic(&mut self.reader)?;
        preamble::read_serialization_header(&mut self.reader)?;

        let entry = preamble::read_object_header(&mut self.reader)?
            .ok_or(FormatError::InvalidFormat("stream has no entry object"))?;
        if entry.name != "Trace" {
            return Err(FormatError::InvalidFormat("entry object must be a Trace").into());
        }
        if entry.version < 1 {
            return Err(FormatError::InvalidFormat("unsupported file format version").into());
        }
        let version = entry.version as u32;
        if (version >= 4) != is_nettrace {
            return Err(FormatError::InvalidFormat("file format version contradicts the magic").into());
        }

        let parameters = preamble::read_trace_parameters(&mut self.reader, version)?;
        self.dispatcher.set_process_id(parameters.process_id);
        preamble::expect_end_object(&mut self.reader)?;

        if version >= 4 {
            self.run_block_loop(version)?;
        } else {
            if version <= 2 && !self.reader.at_eof()? {
                preamble::skip_forward_reference(&mut self.reader)?;
            }
            self.run_flat_loop(version)?;
        }

        let mut cache = std::mem::take(&mut self.cache);
        let registry = &self.registry;
        let dispatcher = &mut self.dispatcher;
        cache.flush(&mut |event| {
            dispatcher.dispatch(registry, event);
            Ok(())
        })?;
        self.stacks.flush();

        let unknown = i32::try_from(self.dispatcher.unknown_dropped()).unwrap_or(i32::MAX);
        Ok(DecodeSummary {
            parameters,
            events_dispatched: self.dispatcher.dispatched(),
            events_lost: cache.events_lost().saturating_add(unknown),
        })
    }

    /// V4+: named blocks until the null-object marker.
    fn run_block_loop(&mut self, version: u32) -> Result<()> {
        loop {
            let Some(header) = preamble::read_object_header(&mut self.reader)? else {
                return Ok(());
            };
            let contents = block::read_block(&mut self.reader)?;
            match BlockKind::from_name(&header.name) {
                BlockKind::Event | BlockKind::Metadata => {
                    self.process_event_block(&contents, version)?;
                }
                BlockKind::Stack => self.stacks.process_stack_block(&contents)?,
                BlockKind::SequencePoint => self.process_sequence_point(&contents)?,
                BlockKind::Trace | BlockKind::Unknown => {
                    debug!(name = %header.name, size = contents.len(), "skipping block");
                }
            }
        }
    }

    /// V1–V3: no block wrappers, events concatenated to end of stream.
    fn run_flat_loop(&mut self, version: u32) -> Result<()> {
        while !self.reader.at_eof()? {
            let size_prefix = self.reader.peek(4)?;
            let event_size = LittleEndian::read_i32(size_prefix);
            if event_size < 0 {
                return Err(FormatError::InvalidFormat("negative event size").into());
            }
            let event_buf = self.reader.read_vec(4 + event_size as usize)?;
            let mut r = ByteReader::new(&event_buf);
            let parsed = EventParser::for_block(version, false).parse(&mut r)?;
            self.handle_event(parsed)?;
        }
        Ok(())
    }

    fn process_event_block(&mut self, contents: &[u8], version: u32) -> Result<()> {
        let mut r = ByteReader::new(contents);
        let header = block::parse_event_block_header(&mut r)?;
        // Compression state never crosses a block boundary.
        let mut parser = EventParser::for_block(version, header.compressed());
        while !r.is_empty() {
            let parsed = parser.parse(&mut r)?;
            self.handle_event(parsed)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, parsed: ParsedEvent<'_>) -> Result<()> {
        if parsed.header.metadata_id == 0 {
            // The payload is a metadata blob describing a future event.
            debug_assert!(
                parsed.header.stack_id == 0
                    && parsed.inline_stack.is_none_or(<[u8]>::is_empty),
                "metadata events carry no stack"
            );
            self.registry.register_blob(parsed.payload)?;
            return Ok(());
        }

        let stack = if let Some(inline) = parsed.inline_stack {
            inline.to_vec()
        } else if parsed.header.stack_id != 0 {
            self.stacks
                .get(parsed.header.stack_id)
                .map(<[u8]>::to_vec)
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let pending = PendingEvent {
            payload: parsed.payload.to_vec(),
            stack,
            header: parsed.header,
        };
        let registry = &self.registry;
        let dispatcher = &mut self.dispatcher;
        self.cache.enqueue(pending, &mut |event| {
            dispatcher.dispatch(registry, event);
            Ok(())
        })
    }

    fn process_sequence_point(&mut self, contents: &[u8]) -> Result<()> {
        let registry = &self.registry;
        let dispatcher = &mut self.dispatcher;
        self.cache.process_sequence_point(contents, &mut |event| {
            dispatcher.dispatch(registry, event);
            Ok(())
        })?;
        self.stacks.flush();
        Ok(())
    }
}
