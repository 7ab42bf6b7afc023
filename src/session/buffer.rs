use crate::utils::ansi::tail_lines;
use std::collections::VecDeque;

/// Character buffer holding at most `max_chars` of the most recent output.
#[derive(Debug)]
pub struct BoundedBuffer {
    chunks: VecDeque<String>,
    /// Total length in chars, not bytes.
    total_chars: usize,
    max_chars: usize,
}

impl BoundedBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_chars: 0,
            max_chars,
        }
    }

    pub fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.total_chars += text.chars().count();
        self.chunks.push_back(text.to_string());
        self.evict();
    }

    fn evict(&mut self) {
        while self.total_chars > self.max_chars {
            let excess = self.total_chars - self.max_chars;
            let Some(front) = self.chunks.front_mut() else {
                self.total_chars = 0;
                return;
            };
            let front_chars = front.chars().count();
            if front_chars <= excess {
                self.total_chars -= front_chars;
                self.chunks.pop_front();
            } else {
                // Keep the chunk's tail, cut on a char boundary.
                let cut = front
                    .char_indices()
                    .nth(excess)
                    .map(|(i, _)| i)
                    .unwrap_or(front.len());
                front.drain(..cut);
                self.total_chars -= excess;
            }
        }
    }

    /// Full contents, or the last `tail` lines when given.
    pub fn snapshot(&self, tail: Option<i64>) -> String {
        let text: String = self.chunks.iter().map(String::as_str).collect();
        match tail {
            Some(n) => tail_lines(&text, n),
            None => text,
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_chars = 0;
    }

    pub fn len(&self) -> usize {
        self.total_chars
    }

    pub fn is_empty(&self) -> bool {
        self.total_chars == 0
    }
}
