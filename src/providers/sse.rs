//! Line decoder for `text/event-stream` replies

use log::trace;

/// One decoded server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent
{   /// JSON payload of a `data:` line
    Data(String)
  , /// `data: [DONE]`
    Done
}

/// Buffers raw bytes until complete lines are available. Transport
/// chunks may split lines or UTF-8 sequences anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder
{   buffer: Vec<u8>
}

impl SseDecoder
{   pub fn new() -> Self
    {   SseDecoder::default()
    }

    /// Feed a chunk and return the events completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent>
    {   self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n')
        {   let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line)
            {   events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that had no newline
    pub fn finish(&mut self) -> Option<SseEvent>
    {   let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<SseEvent>
{   let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\n', '\r']);
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty()
    {   return None;
    }
    if data == "[DONE]"
    {   trace!("End of event stream");
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data.to_string()))
}
