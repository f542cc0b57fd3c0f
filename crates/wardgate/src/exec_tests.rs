use super::*;

fn segs(raw: &str, allow_redirects: bool) -> Vec<Segment> {
    parse_pipeline(raw, allow_redirects).expect("should parse")
}

#[test]
fn splits_on_pipe() {
    let s = segs("rg TODO | rm -rf /", true);
    assert_eq!(s.len(), 2);
    assert_eq!(s[0].command, "rg");
    assert_eq!(s[0].args, vec!["TODO"]);
    assert_eq!(s[1].command, "rm");
    assert_eq!(s[1].args, vec!["-rf", "/"]);
}

#[test]
fn splits_on_chain_operators() {
    let s = segs("ls && rg foo || echo ok; cat x", true);
    assert_eq!(s.len(), 4);
    assert_eq!(s[0].command, "ls");
    assert_eq!(s[1].command, "rg");
    assert_eq!(s[2].command, "echo");
    assert_eq!(s[3].command, "cat");
}

#[test]
fn single_command_is_one_segment() {
    let s = segs("rg TODO src/", true);
    assert_eq!(s.len(), 1);
    assert_eq!(s[0].to_command_line(), "rg TODO src/");
}

#[test]
fn command_substitution_rejected() {
    assert_eq!(
        parse_pipeline("echo $(cat /etc/passwd)", true),
        Err(ExecParseError::CommandSubstitution)
    );
}

#[test]
fn backtick_substitution_rejected() {
    assert_eq!(
        parse_pipeline("echo `cat /etc/passwd`", true),
        Err(ExecParseError::CommandSubstitution)
    );
}

#[test]
fn process_substitution_rejected() {
    assert_eq!(
        parse_pipeline("diff <(ls a) <(ls b)", true),
        Err(ExecParseError::ProcessSubstitution)
    );
    assert_eq!(
        parse_pipeline("tee >(cat)", true),
        Err(ExecParseError::ProcessSubstitution)
    );
}

#[test]
fn subshell_rejected() {
    assert_eq!(
        parse_pipeline("(cd /tmp && rm -rf *)", true),
        Err(ExecParseError::Subshell)
    );
}

#[test]
fn redirect_rejected_unless_allowed() {
    assert_eq!(
        parse_pipeline("echo hi > /etc/passwd", false),
        Err(ExecParseError::RedirectNotAllowed)
    );
    assert!(parse_pipeline("echo hi > /etc/passwd", true).is_ok());
}

#[test]
fn fd_prefixed_redirect_rejected_unless_allowed() {
    assert_eq!(
        parse_pipeline("cmd 2> /dev/null", false),
        Err(ExecParseError::RedirectNotAllowed)
    );
    let ok = segs("cmd 2> /dev/null", true);
    assert_eq!(ok[0].to_command_line(), "cmd 2> /dev/null");
}

#[test]
fn quoted_operators_are_literal() {
    let s = segs("echo 'a && b' '|' ';'", true);
    assert_eq!(s.len(), 1);
    assert_eq!(s[0].args, vec!["a && b", "|", ";"]);
}

#[test]
fn unterminated_quote_errors() {
    assert_eq!(
        parse_pipeline("echo 'unterminated", true),
        Err(ExecParseError::UnterminatedQuote)
    );
}
