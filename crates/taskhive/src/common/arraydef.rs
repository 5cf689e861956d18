use std::fmt;
use std::str::FromStr;

use chumsky::Parser;
use chumsky::primitive::just;
use chumsky::text::TextParser;
use serde::Deserialize;
use serde::Serialize;

use crate::common::parser::{CharParser, ParseError, all_consuming, parse_u32};

/// `count` values starting at `start`, taking every `step`-th one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub start: u32,
    pub count: u32,
    pub step: u32,
}

impl IntRange {
    pub fn new(start: u32, count: u32, step: u32) -> IntRange {
        IntRange { start, count, step }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + use<> {
        let start = self.start;
        (0..self.count)
            .step_by(self.step as usize)
            .map(move |offset| start + offset)
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.start
            && value - self.start < self.count
            && (value - self.start) % self.step == 0
    }

    /// The largest value covered by the range (not necessarily a member for strided ranges)
    fn last(&self) -> u32 {
        self.start + self.count.saturating_sub(1)
    }

    fn id_count(&self) -> u32 {
        self.count.div_ceil(self.step)
    }
}

/// Set of task ids written as ranges, e.g. `1-10,15,20-30:2`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IntArray {
    ranges: Vec<IntRange>,
}

impl IntArray {
    pub fn new(ranges: Vec<IntRange>) -> IntArray {
        IntArray { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn from_sorted_ids(ids: impl Iterator<Item = u32>) -> IntArray {
        let mut ranges: Vec<IntRange> = Vec::new();
        let mut last_id = None;
        for id in ids {
            debug_assert!(last_id.map(|last_id| last_id < id).unwrap_or(true));
            match ranges.last_mut() {
                Some(range) if last_id.map(|last_id| last_id + 1 == id).unwrap_or(false) => {
                    range.count += 1;
                }
                _ => ranges.push(IntRange::new(id, 1, 1)),
            }
            last_id = Some(id);
        }
        IntArray { ranges }
    }

    pub fn from_id(id: u32) -> IntArray {
        Self::from_sorted_ids([id].into_iter())
    }

    pub fn from_range(start: u32, count: u32) -> Self {
        IntArray {
            ranges: vec![IntRange {
                start,
                count,
                step: 1,
            }],
        }
    }

    #[inline]
    pub fn id_count(&self) -> u32 {
        self.ranges.iter().map(|x| x.id_count()).sum()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|x| x.iter())
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.ranges.iter().any(|range| range.contains(id))
    }
}

/// Parses `start[-end][:step]`
fn parse_range() -> impl CharParser<IntRange> {
    let start = parse_u32().labelled("start");
    let end = just('-').ignore_then(parse_u32()).labelled("end").or_not();
    let step = just(':').ignore_then(parse_u32()).labelled("step").or_not();

    start
        .then(end)
        .then(step)
        .try_map(|((start, end), step), span| {
            let end = end.unwrap_or(start);
            if end < start {
                return Err(ParseError::custom(span, "Range ends before it starts"));
            }
            let step = step.unwrap_or(1);
            if step == 0 {
                return Err(ParseError::custom(span, "Step cannot be zero"));
            }
            let count = (end - start)
                .checked_add(1)
                .ok_or_else(|| ParseError::custom(span, "Range is too large"))?;
            Ok(IntRange::new(start, count, step))
        })
        .labelled("range")
}

fn ranges_overlap(a: &IntRange, b: &IntRange) -> bool {
    let low = a.start.max(b.start);
    let high = a.last().min(b.last());
    if low > high {
        return false;
    }
    let (walk, other) = if a.step >= b.step { (a, b) } else { (b, a) };
    walk.iter()
        .skip_while(|id| *id < low)
        .take_while(|id| *id <= high)
        .any(|id| other.contains(id))
}

fn has_overlap(ranges: &[IntRange]) -> bool {
    ranges
        .iter()
        .enumerate()
        .any(|(i, a)| ranges[i + 1..].iter().any(|b| ranges_overlap(a, b)))
}

/// Comma separated ranges that do not share any id
fn parse_array() -> impl CharParser<IntArray> {
    all_consuming(
        parse_range()
            .padded()
            .separated_by(just(','))
            .at_least(1)
            .try_map(|ranges, span| {
                if has_overlap(&ranges) {
                    Err(ParseError::custom(span, "Ranges overlap"))
                } else {
                    Ok(IntArray::new(ranges))
                }
            }),
    )
}

impl FromStr for IntArray {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_array().parse_text(s)
    }
}

impl fmt::Display for IntArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, x) in self.ranges.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            if x.count == 1 {
                write!(f, "{}", x.start)?;
            } else if x.step == 1 {
                write!(f, "{}-{}", x.start, x.start + x.count - 1)?;
            } else {
                write!(f, "{}-{}:{}", x.start, x.start + x.count - 1, x.step)?;
            }
        }
        Ok(())
    }
}
