use chumsky::Parser;
use chumsky::primitive::{choice, filter, just};
use chumsky::text::TextParser;

use hive::resources::{
    ResourceDescriptor, ResourceDescriptorItem, ResourceDescriptorKind, ResourceIndex,
};

use crate::common::parser::{
    CharParser, ParseError, all_consuming, parse_exact_string, parse_u32, parse_u64,
};

fn parse_positive_u32(what: &'static str) -> impl CharParser<u32> {
    parse_u32().labelled(what).try_map(move |value, span| {
        if value == 0 {
            Err(ParseError::custom(span, format!("{what} has to be positive")))
        } else {
            Ok(value)
        }
    })
}

/// `8` (eight CPUs) or `2x4` (two sockets with four CPUs each)
fn parse_cpus_inner() -> impl CharParser<ResourceDescriptor> {
    parse_positive_u32("CPU count")
        .then(just('x').ignore_then(parse_positive_u32("CPUs per socket")).or_not())
        .map(|(first, per_socket)| match per_socket {
            Some(per_socket) => ResourceDescriptor::sockets(first, per_socket),
            None => ResourceDescriptor::simple_cpus(first),
        })
        .padded()
}

pub fn parse_cpu_definition(input: &str) -> anyhow::Result<ResourceDescriptor> {
    all_consuming(parse_cpus_inner()).parse_text(input)
}

fn parse_index_list() -> impl CharParser<Vec<ResourceIndex>> {
    parse_u32()
        .map(ResourceIndex::new)
        .padded()
        .separated_by(just(','))
        .at_least(1)
        .delimited_by(just('['), just(']'))
        .padded()
}

/// `[0,1,3]`
fn parse_list_kind() -> impl CharParser<ResourceDescriptorKind> {
    parse_index_list().try_map(|indices, span| {
        ResourceDescriptorKind::list(indices).map_err(|error| ParseError::custom(span, error))
    })
}

/// `[[0,1],[2,3]]`, each inner list is one group
fn parse_groups_kind() -> impl CharParser<ResourceDescriptorKind> {
    parse_index_list()
        .separated_by(just(','))
        .at_least(1)
        .delimited_by(just('['), just(']'))
        .try_map(|groups, span| {
            ResourceDescriptorKind::groups(groups).map_err(|error| ParseError::custom(span, error))
        })
}

/// `range(2-5)`, both ends included
fn parse_range_kind() -> impl CharParser<ResourceDescriptorKind> {
    let bounds = parse_u32()
        .labelled("start")
        .then_ignore(just('-').padded())
        .then(parse_u32().labelled("end"))
        .padded();
    bounds
        .delimited_by(parse_exact_string("range").then(just('(')), just(')'))
        .try_map(|(start, end), span| {
            if start > end {
                Err(ParseError::custom(span, "Range start is larger than its end"))
            } else {
                Ok(ResourceDescriptorKind::Range {
                    start: start.into(),
                    end: end.into(),
                })
            }
        })
}

/// `sum(4096)`
fn parse_sum_kind() -> impl CharParser<ResourceDescriptorKind> {
    parse_u64()
        .labelled("size")
        .padded()
        .delimited_by(parse_exact_string("sum").then(just('(')), just(')'))
        .map(ResourceDescriptorKind::sum)
}

/// `4`, the same as `range(0-3)`
fn parse_count_kind() -> impl CharParser<ResourceDescriptorKind> {
    parse_positive_u32("resource count").map(ResourceDescriptorKind::simple_indices)
}

fn parse_resource_kind() -> impl CharParser<ResourceDescriptorKind> {
    choice((
        parse_groups_kind(),
        parse_list_kind(),
        parse_range_kind(),
        parse_sum_kind(),
        parse_count_kind(),
    ))
    .padded()
    .labelled("resource kind")
}

fn parse_resource_name() -> impl CharParser<String> {
    let first = filter(|c: &char| c.is_ascii_alphabetic());
    let rest = filter(|c: &char| c.is_ascii_alphanumeric() || matches!(*c, '/' | '_' | '-'));
    first
        .map(Some)
        .chain::<char, Vec<char>, _>(rest.repeated())
        .collect::<String>()
        .labelled("resource name")
}

/// Parses `NAME=KIND`, e.g. `gpus=[0,1]`, `fpga=range(0-3)`, `mem=sum(4096)` or `slots=4`.
pub fn parse_resource_definition(input: &str) -> anyhow::Result<ResourceDescriptorItem> {
    let parser = parse_resource_name()
        .padded()
        .then_ignore(just('='))
        .then(parse_resource_kind())
        .map(|(name, kind)| ResourceDescriptorItem { name, kind });
    all_consuming(parser).parse_text(input)
}
