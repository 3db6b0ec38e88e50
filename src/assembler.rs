//! The multiline state machine: pending lines in, merged events out.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;

use crate::auto_flush::{AutoFlushTarget, AutoFlushTimer};
use crate::config::{MultilineConfig, What};
use crate::encoding_transcode::{Charset, Transcoder};
use crate::event::{MergedEvent, MAX_BYTES_TAG, MAX_LINES_TAG};
use crate::framing::LineTokenizer;
use crate::internal_events::{emit, DownstreamDeliveryError, MergedEventEmitted};
use crate::pattern::LineMatcher;
use crate::sink::{EmissionContext, Listener};

/// A registered multiline codec for one logical stream.
///
/// The assembler has two states: `Empty` (no pending lines) and
/// `Accumulating` (one or more). There is no terminal state; `close` and
/// `flush` return it to `Empty`. All mutable state sits behind one mutex,
/// so line arrivals, explicit flushes, and timer-driven flushes never
/// observe a half-updated buffer.
///
/// Built by [`MultilineConfig::build`]; additional independent assemblers
/// sharing the same configuration come from [`Assembler::spawn_instance`].
pub struct Assembler {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<MultilineConfig>,
    matcher: Arc<LineMatcher>,
    charset: Charset,
    runtime: Option<Handle>,
    timer: AutoFlushTimer,
    state: Mutex<State>,
}

struct State {
    tokenizer: LineTokenizer,
    transcoder: Transcoder,
    buffer: Vec<String>,
    buffer_bytes: usize,
    sequencer: Option<Sequencer>,
    /// Context of the newest decode call.
    last_ctx: Option<EmissionContext>,
    /// Context of the decode call before that. In `previous` mode the
    /// record completed by a fresh line belongs to the stream that
    /// delivered the prior line, so flushes attribute against this one.
    previous_ctx: Option<EmissionContext>,
}

#[derive(Debug)]
struct Sequencer {
    field: String,
    value: i64,
    start: i64,
    rollover: i64,
}

impl Sequencer {
    fn from_config(config: &MultilineConfig) -> Option<Self> {
        config.sequencer_enabled.then(|| Self {
            field: config.sequencer_field.clone(),
            value: config.sequencer_start,
            start: config.sequencer_start,
            rollover: config.sequencer_rollover,
        })
    }

    const fn current(&self) -> i64 {
        self.value
    }

    // The emitted value lives in [start, rollover); rollover itself is
    // never emitted.
    fn advance(&mut self) {
        self.value += 1;
        if self.value >= self.rollover {
            self.value = self.start;
        }
    }
}

enum BoundReached {
    MaxLines,
    MaxBytes,
}

impl BoundReached {
    const fn tag(&self) -> &'static str {
        match self {
            Self::MaxLines => MAX_LINES_TAG,
            Self::MaxBytes => MAX_BYTES_TAG,
        }
    }
}

impl Assembler {
    pub(crate) fn from_parts(
        config: Arc<MultilineConfig>,
        matcher: Arc<LineMatcher>,
        charset: Charset,
        runtime: Option<Handle>,
    ) -> Self {
        let interval = config.auto_flush_interval;
        let state = State {
            tokenizer: LineTokenizer::new(config.delimiter.as_bytes()),
            transcoder: Transcoder::new(charset),
            buffer: Vec::new(),
            buffer_bytes: 0,
            sequencer: Sequencer::from_config(&config),
            last_ctx: None,
            previous_ctx: None,
        };
        let shared = Arc::<Shared>::new_cyclic(|weak| {
            let flush_target: Weak<dyn AutoFlushTarget> = weak.clone();
            Shared {
                timer: AutoFlushTimer::new(interval, runtime.clone(), flush_target),
                state: Mutex::new(state),
                config,
                matcher,
                charset,
                runtime,
            }
        });
        Self { shared }
    }

    /// Creates a fresh, independent assembler sharing this one's
    /// configuration and compiled pattern but none of its buffers,
    /// tokenizer residue, transcoder state, sequence counter, or timer.
    pub fn spawn_instance(&self) -> Self {
        Self::from_parts(
            Arc::clone(&self.shared.config),
            Arc::clone(&self.shared.matcher),
            self.shared.charset,
            self.shared.runtime.clone(),
        )
    }

    pub(crate) fn handle(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Tokenizes and transcodes `data`, feeds each line through the state
    /// machine, and delivers any merged events that materialize to `ctx`.
    ///
    /// Downstream delivery failures are logged and leave the pending buffer
    /// intact for a later flush; they do not propagate out of `decode`.
    pub fn decode(&self, data: &[u8], ctx: &EmissionContext) -> crate::Result<()> {
        let shared = &self.shared;
        let mut state = shared.lock();
        let newest = state.last_ctx.take();
        state.previous_ctx = newest.or_else(|| Some(ctx.clone()));
        state.last_ctx = Some(ctx.clone());

        let lines = state.tokenizer.extract(data);
        for raw in lines {
            let text = state.transcoder.decode_to_utf8(&raw);
            shared.handle_line(&mut state, text, ctx);
        }
        Ok(())
    }

    /// Pass-through emission; the codec is decode-oriented.
    pub fn encode(&self, event: MergedEvent, ctx: &EmissionContext) -> crate::Result<()> {
        ctx.deliver(event)
    }

    /// Forces emission of the pending buffer, if any, against `ctx`.
    ///
    /// On a sink error the buffer is preserved and the error returned (it
    /// has already been logged).
    pub fn flush(&self, ctx: &EmissionContext) -> crate::Result<()> {
        let mut state = self.shared.lock();
        self.shared.flush_locked(&mut state, ctx, None)
    }

    /// Variant of [`Assembler::decode`] taking the data, provenance, and
    /// event receiver from one listener object.
    pub fn accept(&self, listener: Arc<dyn Listener>) -> crate::Result<()> {
        let data = listener.data();
        let ctx = EmissionContext::for_listener(listener);
        self.decode(&data, &ctx)
    }

    /// Flushes against the context of the newest decode call.
    ///
    /// Invoked by the quiet-period timer and by identity eviction. A no-op
    /// when nothing has been decoded yet: with no context there is nowhere
    /// to deliver.
    pub fn auto_flush(&self) {
        self.shared.flush_with_last_seen();
    }

    /// Whether this assembler has a quiet-period timer to drive terminal
    /// flushes on its own.
    pub fn supports_auto_flush(&self) -> bool {
        self.shared.timer.configured()
    }

    /// Terminal flush: stops the timer, runs any tokenizer residue through
    /// the state machine as a final line, then flushes.
    ///
    /// With `ctx` unset the last-seen decode context is used; if there is
    /// none either, the residue is retained in the buffer and nothing is
    /// emitted.
    pub fn close(&self, ctx: Option<&EmissionContext>) -> crate::Result<()> {
        self.shared.timer.stop();
        let mut state = self.shared.lock();
        let residue = state.tokenizer.flush();
        let close_ctx = ctx.cloned().or_else(|| state.last_ctx.clone());
        let Some(close_ctx) = close_ctx else {
            if !residue.is_empty() {
                let text = state.transcoder.decode_to_utf8(&residue);
                Shared::push_line(&mut state, text);
            }
            return Ok(());
        };
        if !residue.is_empty() {
            let text = state.transcoder.decode_to_utf8(&residue);
            self.shared.handle_line(&mut state, text, &close_ctx);
        }
        self.shared.flush_locked(&mut state, &close_ctx, None)
    }

    /// The quiet-period timer, for state inspection.
    pub fn timer(&self) -> &AutoFlushTimer {
        &self.shared.timer
    }

    /// Number of lines currently pending.
    pub fn buffered_lines(&self) -> usize {
        self.shared.lock().buffer.len()
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("what", &self.shared.config.what)
            .field("buffered_lines", &self.buffered_lines())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_with_last_seen(&self) {
        let mut state = self.lock();
        let Some(ctx) = state.last_ctx.clone() else {
            return;
        };
        let _ = self.flush_locked(&mut state, &ctx, None);
    }

    fn handle_line(&self, state: &mut State, line: String, fallback: &EmissionContext) {
        let continues = self.matcher.is_match(&line) != self.config.negate;
        match self.config.what {
            What::Previous => {
                let bound = self.bound_reached(state);
                if !continues || bound.is_some() {
                    let ctx = state
                        .previous_ctx
                        .clone()
                        .unwrap_or_else(|| fallback.clone());
                    let _ = self.flush_locked(state, &ctx, bound);
                }
                if !continues {
                    self.timer.start();
                }
                Self::push_line(state, line);
            }
            What::Next => {
                Self::push_line(state, line);
                if continues {
                    self.timer.start();
                }
                let bound = self.bound_reached(state);
                if !continues || bound.is_some() {
                    let ctx = state.last_ctx.clone().unwrap_or_else(|| fallback.clone());
                    let _ = self.flush_locked(state, &ctx, bound);
                }
            }
        }
    }

    fn bound_reached(&self, state: &State) -> Option<BoundReached> {
        if state.buffer.len() >= self.config.max_lines {
            Some(BoundReached::MaxLines)
        } else if state.buffer_bytes as u64 >= self.config.max_bytes.as_u64() {
            Some(BoundReached::MaxBytes)
        } else {
            None
        }
    }

    fn push_line(state: &mut State, line: String) {
        state.buffer_bytes += line.len();
        state.buffer.push(line);
    }

    fn flush_locked(
        &self,
        state: &mut State,
        ctx: &EmissionContext,
        bound: Option<BoundReached>,
    ) -> crate::Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        let mut event = MergedEvent::new(state.buffer.join(self.config.delimiter.as_str()));
        if state.buffer.len() > 1 && !self.config.multiline_tag.is_empty() {
            event.tags.insert(self.config.multiline_tag.clone());
        }
        if let Some(bound) = &bound {
            event.tags.insert(bound.tag().to_string());
        }
        if let Some(sequencer) = &state.sequencer {
            event.sequence = Some((sequencer.field.clone(), sequencer.current()));
        }

        let lines = state.buffer.len();
        let bytes = state.buffer_bytes;
        match ctx.deliver(event) {
            Ok(()) => {
                state.buffer.clear();
                state.buffer_bytes = 0;
                if let Some(sequencer) = &mut state.sequencer {
                    sequencer.advance();
                }
                emit!(MergedEventEmitted { lines, bytes });
                Ok(())
            }
            Err(error) => {
                emit!(DownstreamDeliveryError { error: &error });
                Err(error)
            }
        }
    }
}

impl AutoFlushTarget for Shared {
    fn auto_flush(&self) {
        self.flush_with_last_seen();
    }

    fn flush_timer(&self) -> &AutoFlushTimer {
        &self.timer
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use bytesize::ByteSize;

    use super::*;

    fn collector() -> (EmissionContext, Arc<StdMutex<Vec<MergedEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let ctx = EmissionContext::from_fn(move |event: MergedEvent| {
            sink_events.lock().unwrap().push(event);
            Ok(())
        });
        (ctx, events)
    }

    fn failing_ctx() -> EmissionContext {
        EmissionContext::from_fn(|_event: MergedEvent| {
            Err("downstream unavailable".into())
        })
    }

    #[test]
    fn previous_mode_groups_indented_lines() {
        let assembler = MultilineConfig::new(r"^\s", What::Previous).build().unwrap();
        let (ctx, events) = collector();

        assembler
            .decode(b"hello world\n   second line\nanother first line\n", &ctx)
            .unwrap();
        assembler.flush(&ctx).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "hello world\n   second line");
        assert!(events[0].has_tag("multiline"));
        assert_eq!(events[1].message, "another first line");
        assert!(!events[1].has_tag("multiline"));
    }

    #[test]
    fn next_mode_attaches_marked_lines_to_their_successor() {
        let assembler = MultilineConfig::new(r"\\$", What::Next).build().unwrap();
        let (ctx, events) = collector();

        assembler
            .decode(b"part one \\\npart two \\\npart three\nplain\n", &ctx)
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "part one \\\npart two \\\npart three");
        assert!(events[0].has_tag("multiline"));
        assert_eq!(events[1].message, "plain");
    }

    #[test]
    fn negate_inverts_the_continuation_predicate() {
        let mut config = MultilineConfig::new(r"^=== ", What::Previous);
        config.negate = true;
        let assembler = config.build().unwrap();
        let (ctx, events) = collector();

        // lines NOT matching the banner continue the record
        assembler
            .decode(b"=== request a\ndetail 1\ndetail 2\n=== request b\n", &ctx)
            .unwrap();
        assembler.flush(&ctx).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "=== request a\ndetail 1\ndetail 2");
        assert_eq!(events[1].message, "=== request b");
    }

    #[test]
    fn max_lines_bound_forces_tagged_flushes() {
        let mut config = MultilineConfig::new("^-", What::Previous);
        config.max_lines = 10;
        config.max_bytes = ByteSize::mb(2);
        let assembler = config.build().unwrap();
        let (ctx, events) = collector();

        for _ in 0..300 {
            assembler.decode(b"- Sample event\n", &ctx).unwrap();
        }
        assembler.flush(&ctx).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 30);
        assert!(events[0].has_tag(MAX_LINES_TAG));
        assert!(!events[29].has_tag(MAX_LINES_TAG));
        let total_lines: usize = events
            .iter()
            .map(|event| event.message.split('\n').count())
            .sum();
        assert_eq!(total_lines, 300);
    }

    #[test]
    fn max_bytes_bound_forces_tagged_flushes() {
        let mut config = MultilineConfig::new("^a", What::Previous);
        config.max_bytes = ByteSize::b(10);
        let assembler = config.build().unwrap();
        let (ctx, events) = collector();

        for _ in 0..4 {
            assembler.decode(b"aaaa\n", &ctx).unwrap();
        }
        assembler.flush(&ctx).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].has_tag(MAX_BYTES_TAG));
        assert_eq!(events[0].message, "aaaa\naaaa\naaaa");
        assert_eq!(events[1].message, "aaaa");
    }

    #[test]
    fn sequencer_wraps_before_rollover() {
        let mut config = MultilineConfig::new(r"^\s", What::Previous);
        config.sequencer_enabled = true;
        config.sequencer_start = 10;
        config.sequencer_rollover = 13;
        let assembler = config.build().unwrap();
        let (ctx, events) = collector();

        assembler.decode(b"10\n11\n12\n10\n", &ctx).unwrap();
        assembler.flush(&ctx).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        for event in events.iter() {
            let expected: i64 = event.message.parse().unwrap();
            assert_eq!(event.sequence, Some(("seq".to_string(), expected)));
        }
    }

    #[test]
    fn downstream_error_preserves_buffer_and_sequence() {
        let mut config = MultilineConfig::new(r"^\s", What::Previous);
        config.sequencer_enabled = true;
        let assembler = config.build().unwrap();

        assembler
            .decode(b"hello world\n second\n third\n", &failing_ctx())
            .unwrap();
        assert_eq!(assembler.buffered_lines(), 3);

        assert!(assembler.flush(&failing_ctx()).is_err());
        assert_eq!(assembler.buffered_lines(), 3);

        let (ctx, events) = collector();
        assembler.flush(&ctx).unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "hello world\n second\n third");
        // the failed attempts never advanced the counter
        assert_eq!(events[0].sequence, Some(("seq".to_string(), 1)));
        assert_eq!(assembler.buffered_lines(), 0);
    }

    #[test]
    fn close_runs_the_tokenizer_residue_through_the_machine() {
        let assembler = MultilineConfig::new(r"^\s", What::Previous).build().unwrap();
        let (ctx, events) = collector();

        assembler.decode(b"first\n trailing piece", &ctx).unwrap();
        assembler.close(None).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "first\n trailing piece");
    }

    #[test]
    fn close_without_any_context_retains_data() {
        let assembler = MultilineConfig::new(r"^\s", What::Previous).build().unwrap();
        assembler.close(None).unwrap();
        assert_eq!(assembler.buffered_lines(), 0);
    }

    #[test]
    fn empty_multiline_tag_is_suppressed() {
        let mut config = MultilineConfig::new(r"^\s", What::Previous);
        config.multiline_tag = String::new();
        let assembler = config.build().unwrap();
        let (ctx, events) = collector();

        assembler.decode(b"a\n b\nc\n", &ctx).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events[0].message, "a\n b");
        assert!(events[0].tags.is_empty());
    }

    #[test]
    fn encode_is_pass_through() {
        let assembler = MultilineConfig::new(r"^\s", What::Previous).build().unwrap();
        let (ctx, events) = collector();
        assembler
            .encode(MergedEvent::new("already merged"), &ctx)
            .unwrap();
        assert_eq!(events.lock().unwrap()[0].message, "already merged");
    }

    #[test]
    fn spawned_instances_share_config_but_not_state() {
        let assembler = MultilineConfig::new(r"^\s", What::Previous).build().unwrap();
        let (ctx, _events) = collector();
        assembler.decode(b"pending line\n extra\n", &ctx).unwrap();

        let spawned = assembler.spawn_instance();
        assert_eq!(assembler.buffered_lines(), 2);
        assert_eq!(spawned.buffered_lines(), 0);

        let (spawned_ctx, spawned_events) = collector();
        spawned.decode(b"own record\n", &spawned_ctx).unwrap();
        spawned.flush(&spawned_ctx).unwrap();
        assert_eq!(spawned_events.lock().unwrap().len(), 1);
        assert_eq!(assembler.buffered_lines(), 2);
    }

    #[test]
    fn custom_delimiter_joins_with_itself() {
        let mut config = MultilineConfig::new(r"^\s", What::Previous);
        config.delimiter = "\r\n".to_string();
        let assembler = config.build().unwrap();
        let (ctx, events) = collector();

        assembler.decode(b"head\r\n tail\r\nnext\r\n", &ctx).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events[0].message, "head\r\n tail");
    }
}
