use std::{
    fmt,
    io::{self, BufReader, Read},
    mem, slice,
};

use derive_more::TryFrom;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFrom)]
#[try_from(repr)]
#[repr(u8)]
enum Command {
    Movr = b'>',
    Movl = b'<',
    Incr = b'+',
    Decr = b'-',
    Writ = b'.',
    Read = b',',
    JmpF = b'[',
    JmpB = b']',
}

/// A node of the program tree. Loops own their bodies and may nest to any
/// depth; dropping, comparing and printing all walk the tree with an
/// explicit stack.
#[derive(Debug)]
pub enum Instruction {
    Increment,
    Decrement,
    MoveLeft,
    MoveRight,
    Output,
    Input,
    Loop(Vec<Instruction>),
}

/// The top-level instruction sequence. Unlike a `Loop` it always runs.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Program(pub Vec<Instruction>);

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("could not read program: {0}")]
    Io(#[from] io::Error),
    #[error("Missing matching brace for {symbol} at position: {position}")]
    Nesting { symbol: char, position: usize },
}

struct Parser<I> {
    bytes: I,
    position: usize,
    strict: bool,
}

impl<I> Parser<I>
where
    I: Iterator<Item = io::Result<u8>>,
{
    fn new(bytes: I, strict: bool) -> Self {
        Parser {
            bytes,
            position: 0,
            strict,
        }
    }

    // anything that is not a command is a comment
    fn next_command(&mut self) -> Result<Option<Command>, ParseError> {
        for byte in self.bytes.by_ref() {
            let byte = byte?;
            self.position += 1;

            if let Ok(command) = Command::try_from(byte) {
                return Ok(Some(command));
            }
        }

        Ok(None)
    }

    fn parse_program(mut self) -> Result<Program, ParseError> {
        use Command as C;
        use Instruction as I;

        // enclosing scopes, innermost last, with the offset of their `[`
        let mut scopes: Vec<(usize, Vec<Instruction>)> = vec![];
        let mut instrs = vec![];

        while let Some(command) = self.next_command()? {
            let instr = match command {
                C::Incr => I::Increment,
                C::Decr => I::Decrement,
                C::Movl => I::MoveLeft,
                C::Movr => I::MoveRight,
                C::Writ => I::Output,
                C::Read => I::Input,
                C::JmpF => {
                    let open = self.position - 1;
                    scopes.push((open, mem::take(&mut instrs)));
                    continue;
                }
                C::JmpB => match scopes.pop() {
                    Some((_, outer)) => {
                        I::Loop(mem::replace(&mut instrs, outer))
                    }
                    None if self.strict => {
                        return Err(ParseError::Nesting {
                            symbol: ']',
                            position: self.position - 1,
                        })
                    }
                    // a stray `]` silently ends the program
                    None => return Ok(Program(instrs)),
                },
            };

            instrs.push(instr);
        }

        // end of input closes every open loop
        while let Some((open, outer)) = scopes.pop() {
            if self.strict {
                return Err(ParseError::Nesting {
                    symbol: '[',
                    position: open,
                });
            }

            let body = mem::replace(&mut instrs, outer);
            instrs.push(I::Loop(body));
        }

        Ok(Program(instrs))
    }
}

impl Program {
    /// Parses a program, closing unterminated loops at end of input and
    /// stopping at a stray `]`.
    pub fn try_parse(reader: impl io::Read) -> Result<Self, ParseError> {
        Parser::new(BufReader::new(reader).bytes(), false).parse_program()
    }

    /// Like [`Program::try_parse`], but rejects unmatched brackets.
    pub fn try_parse_strict(reader: impl io::Read) -> Result<Self, ParseError> {
        Parser::new(BufReader::new(reader).bytes(), true).parse_program()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.0
    }
}

impl From<&str> for Program {
    fn from(value: &str) -> Self {
        let bytes = value.bytes().map(Ok::<u8, io::Error>);

        match Parser::new(bytes, false).parse_program() {
            Ok(program) => program,
            Err(_) => unreachable!("permissive parse of a str cannot fail"),
        }
    }
}

impl Drop for Instruction {
    fn drop(&mut self) {
        let Instruction::Loop(body) = self else {
            return;
        };

        // flatten so that each nested body is dropped empty
        let mut pending = mem::take(body);
        while let Some(mut instr) = pending.pop() {
            if let Instruction::Loop(inner) = &mut instr {
                pending.append(inner);
            }
        }
    }
}

fn same_tree(lhs: &[Instruction], rhs: &[Instruction]) -> bool {
    use Instruction as I;

    let mut pending = vec![(lhs, rhs)];
    while let Some((lhs, rhs)) = pending.pop() {
        if lhs.len() != rhs.len() {
            return false;
        }

        for pair in lhs.iter().zip(rhs) {
            match pair {
                (I::Loop(l), I::Loop(r)) => {
                    pending.push((l.as_slice(), r.as_slice()))
                }
                (I::Loop(_), _) | (_, I::Loop(_)) => return false,
                (l, r) if mem::discriminant(l) != mem::discriminant(r) => {
                    return false
                }
                _ => {}
            }
        }
    }

    true
}

impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        same_tree(slice::from_ref(self), slice::from_ref(other))
    }
}

impl Eq for Instruction {}

fn write_source(
    f: &mut fmt::Formatter<'_>,
    instrs: &[Instruction],
) -> fmt::Result {
    let mut scopes = vec![instrs.iter()];

    while let Some(scope) = scopes.last_mut() {
        let symbol = match scope.next() {
            Some(Instruction::Increment) => "+",
            Some(Instruction::Decrement) => "-",
            Some(Instruction::MoveLeft) => "<",
            Some(Instruction::MoveRight) => ">",
            Some(Instruction::Output) => ".",
            Some(Instruction::Input) => ",",
            Some(Instruction::Loop(body)) => {
                scopes.push(body.iter());
                "["
            }
            None => {
                scopes.pop();
                if scopes.is_empty() {
                    break;
                }
                "]"
            }
        };

        f.write_str(symbol)?;
    }

    Ok(())
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_source(f, slice::from_ref(self))
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_source(f, &self.0)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use Instruction::*;

    struct BrokenReader;

    impl io::Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
    }

    #[test]
    fn parses_transfer_loop() {
        let program = Program::from("++>+++++[<+>-]<.");

        assert_eq!(
            program.0,
            vec![
                Increment,
                Increment,
                MoveRight,
                Increment,
                Increment,
                Increment,
                Increment,
                Increment,
                Loop(vec![MoveLeft, Increment, MoveRight, Decrement]),
                MoveLeft,
                Output,
            ]
        );
    }

    #[test]
    fn empty_loop() {
        assert_eq!(Program::from("[]").0, vec![Loop(vec![])]);
    }

    #[test]
    fn empty_input() {
        assert_eq!(Program::from("").0, vec![]);
        assert_eq!(Program::from("just a comment").0, vec![]);
    }

    #[test]
    fn comments_are_transparent() {
        let plain = Program::from(",[->+<]>.");
        let noisy =
            Program::from("read: , loop [ -  > + < ] \n done > print . !");

        assert_eq!(plain, noisy);
    }

    #[test]
    fn deep_nesting() {
        let program = Program::from("[[[+]]-]");

        assert_eq!(
            program.0,
            vec![Loop(vec![Loop(vec![Loop(vec![Increment])]), Decrement])]
        );
    }

    #[test]
    fn display_round_trips() {
        let source = "some +text+ [>,.<[-]] here <>";
        let program = Program::from(source);
        let printed = program.to_string();

        assert_eq!(printed, "++[>,.<[-]]<>");
        assert_eq!(Program::from(printed.as_str()), program);
    }

    #[test]
    fn unclosed_loop_closes_at_eof() {
        assert_eq!(
            Program::from("+[>[-").0,
            vec![Increment, Loop(vec![MoveRight, Loop(vec![Decrement])])]
        );
    }

    #[test]
    fn stray_close_ends_program() {
        assert_eq!(Program::from("+]-").0, vec![Increment]);
    }

    #[test]
    fn strict_accepts_balanced() {
        let program = Program::try_parse_strict("+[-]".as_bytes()).unwrap();

        assert_eq!(program.0, vec![Increment, Loop(vec![Decrement])]);
    }

    #[test]
    fn strict_rejects_unclosed() {
        let err = Program::try_parse_strict("+ [[-]".as_bytes()).unwrap_err();

        assert!(matches!(
            err,
            ParseError::Nesting {
                symbol: '[',
                position: 2
            }
        ));
    }

    #[test]
    fn strict_rejects_stray_close() {
        let err = Program::try_parse_strict("+-]".as_bytes()).unwrap_err();

        assert!(matches!(
            err,
            ParseError::Nesting {
                symbol: ']',
                position: 2
            }
        ));
    }

    struct CountingReader<'a> {
        source: &'a [u8],
        reads: usize,
    }

    impl io::Read for CountingReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            self.source.read(buf)
        }
    }

    #[test]
    fn reads_in_blocks() {
        let source = "+>".repeat(1000);
        let mut reader = CountingReader {
            source: source.as_bytes(),
            reads: 0,
        };

        let program = Program::try_parse(&mut reader).unwrap();

        assert_eq!(program.instructions().len(), 2000);
        // one fill and one read at EOF, not one per byte
        assert!(reader.reads <= 2, "{} reads", reader.reads);

        let mut reader = CountingReader {
            source: source.as_bytes(),
            reads: 0,
        };
        Program::try_parse_strict(&mut reader).unwrap();
        assert!(reader.reads <= 2, "{} reads", reader.reads);
    }

    #[test]
    fn read_failure_is_reported() {
        let err = Program::try_parse(BrokenReader).unwrap_err();

        assert!(matches!(err, ParseError::Io(_)));
    }

    #[test]
    fn nesting_depth_is_unbounded() {
        let depth = 100_000;
        let source = "[".repeat(depth) + "+" + &"]".repeat(depth);

        let program = Program::from(source.as_str());
        let again = Program::try_parse(source.as_bytes()).unwrap();

        assert!(program == again);
        assert!(program.to_string() == source);

        drop(program);
        drop(again);
    }

    #[test]
    fn loops_differ_from_leaves() {
        assert_ne!(Program::from("[+]"), Program::from("[-]"));
        assert_ne!(Program::from("[[]]"), Program::from("[+]"));
        assert_ne!(Program::from("[]+"), Program::from("[+]"));
    }
}
