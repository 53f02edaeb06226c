/*!
    Result codes exchanged with the byte source and the demux graph.
*/

use std::fmt;

/**
    Outcome of a single read against the external byte source.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReadResult {
    /// The bytes were delivered, possibly fewer than requested.
    #[default]
    Success,
    /// The source failed; the request is abandoned.
    Failure,
    /// No more data at the requested offset.
    Eos,
    /// The source cancelled the read because it is being flushed.
    Flushing,
}

impl ReadResult {
    /**
        Returns true for every result other than [`ReadResult::Success`].
    */
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Success)
    }

    /**
        Maps the read outcome onto the data-flow result handed to the graph.
    */
    pub const fn into_flow(self) -> Result<(), FlowError> {
        match self {
            Self::Success => Ok(()),
            Self::Failure => Err(FlowError::Error),
            Self::Eos => Err(FlowError::Eos),
            Self::Flushing => Err(FlowError::Flushing),
        }
    }
}

/**
    Non-success data-flow results, as reported to or by graph threads.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowError {
    /// The receiving side is flushing; the data was discarded.
    Flushing,
    /// End of stream was reached.
    Eos,
    /// A fatal error occurred.
    Error,
    /// The receiving pad is not linked to anything.
    NotLinked,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Flushing => "flushing",
            Self::Eos => "eos",
            Self::Error => "error",
            Self::NotLinked => "not-linked",
        };
        f.write_str(name)
    }
}

impl std::error::Error for FlowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_result_maps_to_flow() {
        assert_eq!(ReadResult::Success.into_flow(), Ok(()));
        assert_eq!(ReadResult::Failure.into_flow(), Err(FlowError::Error));
        assert_eq!(ReadResult::Eos.into_flow(), Err(FlowError::Eos));
        assert_eq!(ReadResult::Flushing.into_flow(), Err(FlowError::Flushing));
    }

    #[test]
    fn only_success_is_not_terminal() {
        assert!(!ReadResult::Success.is_terminal());
        assert!(ReadResult::Eos.is_terminal());
        assert!(ReadResult::Failure.is_terminal());
    }
}
