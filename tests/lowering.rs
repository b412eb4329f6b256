use pretty_assertions::assert_eq;

use tapeir::{
    frontend::{
        codegen::{codegen, ENTRY_POINT},
        parser::Program,
    },
    ir::{
        exec::{ExecError, Executor},
        passes::optimize,
        verify::verify_module,
        Module,
    },
};

const HELLO_WORLD: &str = concat!(
    "++++++++[>++++[>++>+++>+++>+<<<<-]>+>+>->>+[<]<-]",
    ">>.>---.+++++++..+++.>>.<-.<.+++.------.--------.>>+.>++.",
);

fn placed_insts(module: &Module) -> usize {
    module
        .function(ENTRY_POINT)
        .map_or(0, |main| main.iter_insts().count())
}

fn execute(module: &Module, input: &[u8]) -> Result<Vec<u8>, ExecError> {
    let mut exec = Executor::new(input, vec![]).with_fuel(1_000_000);
    exec.run(module, ENTRY_POINT)?;
    Ok(exec.into_output())
}

fn run(source: &str, input: &[u8]) -> Vec<u8> {
    let module = codegen(&Program::from(source)).unwrap();
    execute(&module, input).unwrap()
}

#[test]
fn transfer_loop() {
    assert_eq!(run("++>+++++[<+>-]<.", b""), vec![7]);
}

#[test]
fn hello_world() {
    assert_eq!(run(HELLO_WORLD, b""), b"Hello World!\n");
}

#[test]
fn empty_loop_does_no_io() {
    let module = codegen(&Program::from("[]")).unwrap();

    assert!(module.externs.is_empty());
    assert_eq!(execute(&module, b"unread").unwrap(), b"");
}

#[test]
fn echo() {
    assert_eq!(run(",.", b"A"), b"A");
    assert_eq!(run(",.,.,.", b"xyz"), b"xyz");
}

#[test]
fn eof_stores_truncated_minus_one() {
    assert_eq!(run(",.", b""), vec![0xFF]);
}

#[test]
fn cells_wrap_around() {
    let up = "+".repeat(256) + ".";
    assert_eq!(run(&up, b""), vec![0]);

    assert_eq!(run("-.", b""), vec![255]);
}

#[test]
fn loop_entered_on_zero_never_runs() {
    assert_eq!(run("[.+.]>+.", b""), vec![1]);
}

#[test]
fn loop_retests_after_each_iteration() {
    assert_eq!(run("+++[.-]", b""), vec![3, 2, 1]);
}

#[test]
fn nested_loops_retest_the_outer_cell() {
    // 2 outer iterations of 3 inner ones
    assert_eq!(run("++[>+++[>+<-]<-]>>.", b""), vec![6]);
    // the inner loop ends on the cell the outer test reads
    assert_eq!(run("+++[>+<[-]]>.", b""), vec![1]);
}

#[test]
fn comments_are_transparent() {
    let noisy = "print two: + and + then . done\n";
    assert_eq!(run(noisy, b""), run("++.", b""));
}

#[test]
fn unclosed_loop_closes_at_eof() {
    assert_eq!(run("++[.-", b""), vec![2, 1]);
}

#[test]
fn stray_close_ends_program() {
    assert_eq!(run("+.]+.", b""), vec![1]);
}

#[test]
fn moving_left_of_the_tape_faults() {
    let module = codegen(&Program::from("<+")).unwrap();

    assert!(matches!(
        execute(&module, b""),
        Err(ExecError::OutOfBounds { .. })
    ));
}

#[test]
fn moving_right_of_the_tape_faults() {
    let source = ">".repeat(0x4000) + "+";
    let module = codegen(&Program::from(source.as_str())).unwrap();

    assert!(matches!(
        execute(&module, b""),
        Err(ExecError::OutOfBounds { .. })
    ));
}

#[test]
fn optimized_module_behaves_the_same() {
    let cases: [(&str, &[u8]); 4] = [
        (HELLO_WORLD, b""),
        ("++>+++++[<+>-]<.", b""),
        (",+[-.,+]", b"echo"),
        ("+++[>+<[-]]>.", b""),
    ];

    for (source, input) in cases {
        let mut module = codegen(&Program::from(source)).unwrap();
        let expected = execute(&module, input).unwrap();
        let before = placed_insts(&module);

        let changes = module.function_mut(ENTRY_POINT).map_or(0, optimize);

        assert!(changes > 0, "{source}");
        assert!(placed_insts(&module) < before, "{source}");
        assert_eq!(verify_module(&module), Ok(()));
        assert_eq!(execute(&module, input).unwrap(), expected);
    }
}

#[test]
fn optimizing_twice_changes_nothing() {
    let mut module = codegen(&Program::from(HELLO_WORLD)).unwrap();
    if let Some(main) = module.function_mut(ENTRY_POINT) {
        optimize(main);
    }
    let once = module.to_string();

    let changes = module.function_mut(ENTRY_POINT).map_or(0, optimize);

    assert_eq!(changes, 0);
    assert_eq!(module.to_string(), once);
}

#[test]
fn deep_nesting_lowers_without_overflow() {
    const DEPTH: usize = 100_000;
    let source = "[".repeat(DEPTH) + "+" + &"]".repeat(DEPTH);

    let program = Program::from(source.as_str());
    assert_eq!(program.to_string(), source);

    let module = codegen(&program).unwrap();
    assert_eq!(verify_module(&module), Ok(()));
    // every entry test sees a zero cell
    assert_eq!(execute(&module, b"").unwrap(), b"");
    assert!(!module.to_string().is_empty());

    drop(module);
    drop(program);
}

#[test]
fn display_round_trips_through_the_parser() {
    let program = Program::from(HELLO_WORLD);
    let printed = program.to_string();
    let reparsed = Program::try_parse(printed.as_bytes()).unwrap();

    assert_eq!(reparsed, program);
    assert_eq!(reparsed.to_string(), HELLO_WORLD);
}
