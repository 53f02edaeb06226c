/*!
    Events delivered to the consumer of an output stream.
*/

use std::time::Duration;

/**
    Metadata of a buffer held by an output stream.

    The payload itself stays inside the stream until it is released; the
    consumer copies out the ranges it needs.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    /// Presentation timestamp, if the graph assigned one.
    pub pts: Option<Duration>,
    /// Buffer duration, if known.
    pub duration: Option<Duration>,
    /// The buffer follows a gap or a seek.
    pub discontinuity: bool,
    /// The buffer was produced for preroll only.
    pub preroll: bool,
    /// The buffer cannot be decoded on its own.
    pub delta: bool,
    /// Payload size in bytes.
    pub size: usize,
}

/**
    A new timing context for the buffers that follow.
*/
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentEvent {
    /// Stream time of the first buffer in the segment.
    pub position: Duration,
    /// Stream time at which the segment ends, if bounded.
    pub stop: Option<Duration>,
    /// Effective playback rate.
    pub rate: f64,
}

/**
    One event read from an output stream.

    An empty stream slot is represented by the absence of an event, so every
    variant carries data the consumer has to act on.
*/
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StreamEvent {
    /// A buffer is held; copy it out and release it.
    Buffer(BufferInfo),
    /// Timing context for subsequent buffers.
    Segment(SegmentEvent),
    /// No more events will follow until the next flush.
    Eos,
}

impl StreamEvent {
    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer(_))
    }

    pub fn is_eos(&self) -> bool {
        matches!(self, Self::Eos)
    }
}

/**
    Time segment as negotiated by the graph on one output stream.

    Used to convert between stream time, in which buffer timestamps are
    reported, and running time, in which quality-of-service feedback is
    expressed.
*/
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeSegment {
    /// Requested playback rate.
    pub rate: f64,
    /// Rate already applied upstream.
    pub applied_rate: f64,
    /// Start of the segment in stream time.
    pub start: Duration,
    /// End of the segment in stream time, if bounded.
    pub stop: Option<Duration>,
    /// Running time at which the segment starts.
    pub base: Duration,
    /// Current position in stream time.
    pub position: Duration,
}

impl Default for TimeSegment {
    fn default() -> Self {
        Self {
            rate: 1.0,
            applied_rate: 1.0,
            start: Duration::ZERO,
            stop: None,
            base: Duration::ZERO,
            position: Duration::ZERO,
        }
    }
}

impl TimeSegment {
    /**
        Converts a stream timestamp into running time.

        Returns `None` when the timestamp falls outside the segment, when a
        reverse segment has no stop position to count back from, or when the
        result does not fit in a [`Duration`].
    */
    pub fn to_running_time(&self, timestamp: Duration) -> Option<Duration> {
        if timestamp < self.start {
            return None;
        }
        if let Some(stop) = self.stop {
            if timestamp > stop {
                return None;
            }
        }
        if self.rate == 0.0 || !self.rate.is_finite() {
            return None;
        }

        let offset = if self.rate > 0.0 {
            timestamp - self.start
        } else {
            self.stop? - timestamp
        };

        let scaled = Duration::try_from_secs_f64(offset.as_secs_f64() / self.rate.abs()).ok()?;
        self.base.checked_add(scaled)
    }

    /**
        Returns the event announcing this segment to the consumer.
    */
    pub fn to_event(&self) -> SegmentEvent {
        SegmentEvent {
            position: self.position,
            stop: self.stop,
            rate: self.rate * self.applied_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn running_time_forward() {
        let segment = TimeSegment {
            start: ms(1000),
            base: ms(200),
            ..Default::default()
        };
        assert_eq!(segment.to_running_time(ms(1500)), Some(ms(700)));
        assert_eq!(segment.to_running_time(ms(999)), None);
    }

    #[test]
    fn running_time_scales_with_rate() {
        let segment = TimeSegment {
            rate: 2.0,
            ..Default::default()
        };
        assert_eq!(segment.to_running_time(ms(1000)), Some(ms(500)));
    }

    #[test]
    fn running_time_reverse_needs_stop() {
        let mut segment = TimeSegment {
            rate: -1.0,
            ..Default::default()
        };
        assert_eq!(segment.to_running_time(ms(10)), None);

        segment.stop = Some(ms(100));
        assert_eq!(segment.to_running_time(ms(40)), Some(ms(60)));
        assert_eq!(segment.to_running_time(ms(101)), None);
    }

    #[test]
    fn running_time_overflow_is_rejected() {
        let slow = TimeSegment {
            rate: 1e-300,
            ..Default::default()
        };
        assert_eq!(slow.to_running_time(ms(1000)), None);

        let late = TimeSegment {
            base: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(late.to_running_time(ms(1)), None);
        assert_eq!(late.to_running_time(Duration::ZERO), Some(Duration::MAX));
    }

    #[test]
    fn segment_event_combines_rates() {
        let segment = TimeSegment {
            rate: 2.0,
            applied_rate: 0.5,
            position: ms(30),
            stop: Some(ms(90)),
            ..Default::default()
        };
        let event = segment.to_event();
        assert_eq!(event.rate, 1.0);
        assert_eq!(event.position, ms(30));
        assert_eq!(event.stop, Some(ms(90)));
    }
}
