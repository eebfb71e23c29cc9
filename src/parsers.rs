//! nom parsers for the line-oriented key=value replies of the SAM bridge.

use nom::{
	branch::alt,
	bytes::complete::{tag, take_till},
	character::complete::{alphanumeric1, char, space1},
	multi::separated_list0,
	sequence::{delimited, preceded, separated_pair, terminated},
	IResult,
};

fn is_space_or_next_line(chr: char) -> bool {
	chr == ' ' || chr == '\t' || chr == '\n' || chr == '\r'
}

fn quoted_value(input: &str) -> IResult<&str, &str> {
	delimited(char('"'), take_till(|c| c == '"'), char('"'))(input)
}

fn bare_value(input: &str) -> IResult<&str, &str> {
	take_till(is_space_or_next_line)(input)
}

fn key_value(input: &str) -> IResult<&str, (&str, &str)> {
	separated_pair(alphanumeric1, char('='), alt((quoted_value, bare_value)))(input)
}

fn keys_and_values(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
	separated_list0(space1, key_value)(input)
}

fn reply(prefix: &'static str) -> impl Fn(&str) -> IResult<&str, Vec<(&str, &str)>> {
	move |input| {
		terminated(
			preceded(tag(prefix), keys_and_values),
			preceded(take_till(|c| c == '\n'), tag("\n")),
		)(input)
	}
}

pub fn sam_hello(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
	reply("HELLO REPLY ")(input)
}

pub fn sam_session_status(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
	reply("SESSION STATUS ")(input)
}

pub fn sam_stream_status(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
	reply("STREAM STATUS ")(input)
}

pub fn sam_naming_reply(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
	reply("NAMING REPLY ")(input)
}

pub fn sam_dest_reply(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
	reply("DEST REPLY ")(input)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hello() {
		assert_eq!(
			sam_hello("HELLO REPLY RESULT=OK VERSION=3.3\n"),
			Ok(("", vec![("RESULT", "OK"), ("VERSION", "3.3")]))
		);
		assert_eq!(
			sam_hello("HELLO REPLY RESULT=NOVERSION\n"),
			Ok(("", vec![("RESULT", "NOVERSION")]))
		);
		assert_eq!(
			sam_hello("HELLO REPLY RESULT=I2P_ERROR MESSAGE=\"Something failed\"\n"),
			Ok((
				"",
				vec![("RESULT", "I2P_ERROR"), ("MESSAGE", "Something failed")]
			))
		);
	}

	#[test]
	fn session_status() {
		assert_eq!(
			sam_session_status("SESSION STATUS RESULT=OK DESTINATION=privkey\n"),
			Ok(("", vec![("RESULT", "OK"), ("DESTINATION", "privkey")]))
		);
		assert_eq!(
			sam_session_status("SESSION STATUS RESULT=DUPLICATED_ID\n"),
			Ok(("", vec![("RESULT", "DUPLICATED_ID")]))
		);
	}

	#[test]
	fn stream_status() {
		assert_eq!(
			sam_stream_status("STREAM STATUS RESULT=OK\n"),
			Ok(("", vec![("RESULT", "OK")]))
		);
		assert_eq!(
			sam_stream_status(
				"STREAM STATUS RESULT=CANT_REACH_PEER MESSAGE=\"Can't reach peer\"\n"
			),
			Ok((
				"",
				vec![
					("RESULT", "CANT_REACH_PEER"),
					("MESSAGE", "Can't reach peer")
				]
			))
		);
	}

	#[test]
	fn naming_reply() {
		assert_eq!(
			sam_naming_reply("NAMING REPLY RESULT=OK NAME=name VALUE=dest\n"),
			Ok((
				"",
				vec![("RESULT", "OK"), ("NAME", "name"), ("VALUE", "dest")]
			))
		);
		assert!(sam_naming_reply("NAMINGREPLY RESULT=KEY_NOT_FOUND\n").is_err());
		assert!(sam_naming_reply("NAMING  REPLY RESULT=KEY_NOT_FOUND\n").is_err());
	}

	#[test]
	fn dest_reply() {
		assert_eq!(
			sam_dest_reply("DEST REPLY PUB=foo PRIV=foobar\n"),
			Ok(("", vec![("PUB", "foo"), ("PRIV", "foobar")]))
		);
	}
}
