//! End-to-end protocol tests against a live agent on an ephemeral port.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use tether_agent::server::Listener;
use tether_protocol::{
    ChunkKind, CommandHeader, CommandKind, ExecChunkHeader, MemoryRange, COMMAND_MAGIC,
    INVALID_PID, SERVER_MAGIC_VERSION, SYSNAME_LEN,
};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Start an agent on an ephemeral port and return a connected client that
/// has already consumed the banner.
fn connect() -> TcpStream {
    let listener = Listener::bind(0).expect("bind ephemeral port");
    let port = listener.local_port().expect("query bound port");
    thread::spawn(move || {
        let _ = listener.run();
    });

    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .expect("set read timeout");
    let mut stream = stream;
    read_banner(&mut stream);
    stream
}

fn read_banner(stream: &mut TcpStream) -> Vec<u8> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).expect("banner magic");
    assert_eq!(u32::from_le_bytes(magic), SERVER_MAGIC_VERSION);

    let mut sysname = vec![0u8; SYSNAME_LEN];
    stream.read_exact(&mut sysname).expect("banner sysname");
    sysname
}

fn send_command(stream: &mut TcpStream, kind: CommandKind) {
    stream
        .write_all(&CommandHeader::new(kind).encode())
        .expect("send command header");
}

fn read_u32(stream: &mut TcpStream) -> u32 {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).expect("read u32");
    u32::from_le_bytes(buf)
}

fn read_u64(stream: &mut TcpStream) -> u64 {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).expect("read u64");
    u64::from_le_bytes(buf)
}

fn write_string(stream: &mut TcpStream, s: &[u8]) {
    stream
        .write_all(&(s.len() as u32).to_le_bytes())
        .expect("string length");
    stream.write_all(s).expect("string bytes");
}

fn send_exec(stream: &mut TcpStream, background: bool, argv: &[&[u8]]) {
    send_command(stream, CommandKind::Exec);
    stream
        .write_all(&[u8::from(background)])
        .expect("background flag");
    stream
        .write_all(&(argv.len() as u32).to_le_bytes())
        .expect("argc");
    for arg in argv {
        write_string(stream, arg);
    }
    stream.write_all(&0u32.to_le_bytes()).expect("envc");
}

/// Collect exec chunks until the exit chunk; returns (stdout bytes, status).
fn read_exec_chunks(stream: &mut TcpStream) -> (Vec<u8>, i32) {
    let mut stdout = Vec::new();
    loop {
        let mut header = [0u8; ExecChunkHeader::SIZE];
        stream.read_exact(&mut header).expect("chunk header");
        let chunk = ExecChunkHeader::decode(&header);
        let mut payload = vec![0u8; chunk.size as usize];
        stream.read_exact(&mut payload).expect("chunk payload");

        match ChunkKind::from_u32(chunk.kind).expect("chunk kind") {
            ChunkKind::Stdout => stdout.extend_from_slice(&payload),
            ChunkKind::Exit => {
                assert_eq!(chunk.size, 4);
                let status = i32::from_le_bytes(payload.try_into().expect("status word"));
                return (stdout, status);
            }
        }
    }
}

fn expect_clean_close(stream: &mut TcpStream) {
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).expect("probe for close"), 0);
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

fn uname_sysname() -> Vec<u8> {
    // SAFETY: utsname is plain data; uname fills it or fails.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    assert_eq!(unsafe { libc::uname(&mut uts) }, 0);
    // SAFETY: the kernel NUL-terminates sysname.
    unsafe { std::ffi::CStr::from_ptr(uts.sysname.as_ptr()) }
        .to_bytes()
        .to_vec()
}

#[test]
fn banner_reports_the_host_sysname() {
    let listener = Listener::bind(0).unwrap();
    let port = listener.local_port().unwrap();
    thread::spawn(move || {
        let _ = listener.run();
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    let sysname = read_banner(&mut stream);

    let expected = uname_sysname();
    let nul = sysname.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&sysname[..nul], expected.as_slice());
    assert!(sysname[nul..].iter().all(|&b| b == 0));
}

#[test]
fn close_command_closes_without_further_bytes() {
    let mut stream = connect();
    send_command(&mut stream, CommandKind::Close);
    expect_clean_close(&mut stream);
}

#[test]
fn bad_magic_closes_without_reply() {
    let mut stream = connect();
    let bogus = CommandHeader {
        magic: 0,
        kind: CommandKind::Exec as u32,
    };
    stream.write_all(&bogus.encode()).unwrap();
    expect_clean_close(&mut stream);
}

#[test]
fn background_exec_reports_a_real_pid_and_nothing_else() {
    let mut stream = connect();
    send_exec(&mut stream, true, &[b"/bin/true".as_slice()]);

    let pid = read_u32(&mut stream);
    assert_ne!(pid, INVALID_PID);
    assert_ne!(pid, 0);

    // No chunks follow a background exec; the session is immediately usable.
    send_command(&mut stream, CommandKind::Close);
    expect_clean_close(&mut stream);
}

#[test]
fn foreground_exec_streams_output_and_one_exit_chunk() {
    let mut stream = connect();
    send_exec(&mut stream, false, &[b"/bin/echo".as_slice(), b"hi".as_slice()]);

    let pid = read_u32(&mut stream);
    assert_ne!(pid, INVALID_PID);

    let (stdout, status) = read_exec_chunks(&mut stream);
    // The pty cooks the newline into \r\n.
    assert!(stdout.starts_with(b"hi\r\n"), "stdout was {stdout:?}");
    assert_eq!(status, 0);

    // Exactly one exit chunk: the next command still works.
    send_command(&mut stream, CommandKind::GetDummyBlock);
    assert_ne!(read_u64(&mut stream), 0);
}

#[test]
fn foreground_exec_relays_socket_bytes_to_the_child() {
    let mut stream = connect();
    send_exec(&mut stream, false, &[b"/bin/cat".as_slice()]);

    let pid = read_u32(&mut stream);
    assert_ne!(pid, INVALID_PID);

    stream.write_all(b"roundtrip\n").unwrap();

    // cat echoes the line back; the pty also echoes the input itself, so
    // just look for the payload, then close our side to end the pump.
    let mut seen = Vec::new();
    loop {
        let mut header = [0u8; ExecChunkHeader::SIZE];
        stream.read_exact(&mut header).unwrap();
        let chunk = ExecChunkHeader::decode(&header);
        let mut payload = vec![0u8; chunk.size as usize];
        stream.read_exact(&mut payload).unwrap();
        assert_eq!(chunk.kind, ChunkKind::Stdout as u32);
        seen.extend_from_slice(&payload);
        if count_occurrences(&seen, b"roundtrip") >= 2 {
            break;
        }
    }
    drop(stream);
}

#[test]
fn spawn_failure_reports_the_sentinel_and_keeps_the_session() {
    let mut stream = connect();
    send_exec(&mut stream, false, &[b"/definitely/not/a/real/binary".as_slice()]);

    assert_eq!(read_u32(&mut stream), INVALID_PID);

    // The session survives a spawn failure.
    send_command(&mut stream, CommandKind::GetDummyBlock);
    assert_ne!(read_u64(&mut stream), 0);
    send_command(&mut stream, CommandKind::Close);
    expect_clean_close(&mut stream);
}

#[test]
fn empty_argv_is_a_protocol_violation() {
    let mut stream = connect();
    send_command(&mut stream, CommandKind::Exec);
    stream.write_all(&[0u8]).unwrap();
    stream.write_all(&0u32.to_le_bytes()).unwrap();
    expect_clean_close(&mut stream);
}

#[test]
fn oversized_call_arity_is_a_protocol_violation() {
    let mut stream = connect();
    send_command(&mut stream, CommandKind::Call);
    stream.write_all(&0u64.to_le_bytes()).unwrap();
    stream.write_all(&12u64.to_le_bytes()).unwrap();
    expect_clean_close(&mut stream);
}

#[cfg(target_os = "linux")]
#[test]
fn loader_round_trip_and_call_return_the_agent_pid() {
    let mut stream = connect();

    // DLOPEN libc.
    send_command(&mut stream, CommandKind::Dlopen);
    let mut field = [0u8; 1024];
    field[..9].copy_from_slice(b"libc.so.6");
    stream.write_all(&field).unwrap();
    stream.write_all(&(libc::RTLD_NOW as u32).to_le_bytes()).unwrap();
    let handle = read_u64(&mut stream);
    assert_ne!(handle, 0);

    // DLSYM getpid.
    send_command(&mut stream, CommandKind::Dlsym);
    stream.write_all(&handle.to_le_bytes()).unwrap();
    let mut field = [0u8; 1024];
    field[..6].copy_from_slice(b"getpid");
    stream.write_all(&field).unwrap();
    let address = read_u64(&mut stream);
    assert_ne!(address, 0);

    // CALL it with no arguments: the agent runs in this test process.
    send_command(&mut stream, CommandKind::Call);
    stream.write_all(&address.to_le_bytes()).unwrap();
    stream.write_all(&0u64.to_le_bytes()).unwrap();
    assert_eq!(read_u64(&mut stream) as u32, std::process::id());

    // DLCLOSE returns zero.
    send_command(&mut stream, CommandKind::Dlclose);
    stream.write_all(&handle.to_le_bytes()).unwrap();
    assert_eq!(read_u64(&mut stream), 0);
}

#[cfg(target_os = "linux")]
#[test]
fn call_identity_through_labs() {
    let mut stream = connect();

    send_command(&mut stream, CommandKind::Dlopen);
    let mut field = [0u8; 1024];
    field[..9].copy_from_slice(b"libc.so.6");
    stream.write_all(&field).unwrap();
    stream.write_all(&(libc::RTLD_NOW as u32).to_le_bytes()).unwrap();
    let handle = read_u64(&mut stream);
    assert_ne!(handle, 0);

    send_command(&mut stream, CommandKind::Dlsym);
    stream.write_all(&handle.to_le_bytes()).unwrap();
    let mut field = [0u8; 1024];
    field[..4].copy_from_slice(b"labs");
    stream.write_all(&field).unwrap();
    let address = read_u64(&mut stream);
    assert_ne!(address, 0);

    // labs returns its (non-negative) argument unchanged.
    send_command(&mut stream, CommandKind::Call);
    stream.write_all(&address.to_le_bytes()).unwrap();
    stream.write_all(&1u64.to_le_bytes()).unwrap();
    stream.write_all(&0x1234_5678u64.to_le_bytes()).unwrap();
    assert_eq!(read_u64(&mut stream), 0x1234_5678);
}

#[cfg(not(target_os = "macos"))]
#[test]
fn poke_then_peek_round_trips_agent_memory() {
    // The agent serves from this test process, so this buffer is in its
    // address space.
    let mut target = [0u8; 32];
    let address = target.as_mut_ptr() as u64;
    let pattern: Vec<u8> = (0..32).collect();

    let mut stream = connect();

    send_command(&mut stream, CommandKind::Poke);
    stream
        .write_all(&MemoryRange { address, size: 32 }.encode())
        .unwrap();
    stream.write_all(&pattern).unwrap();

    let mut header = [0u8; CommandHeader::SIZE];
    stream.read_exact(&mut header).unwrap();
    let reply = CommandHeader::decode(&header);
    assert_eq!(reply.magic, COMMAND_MAGIC);
    assert_eq!(reply.kind, CommandKind::ReplyPoke as u32);

    send_command(&mut stream, CommandKind::Peek);
    stream
        .write_all(&MemoryRange { address, size: 32 }.encode())
        .unwrap();

    let mut header = [0u8; CommandHeader::SIZE];
    stream.read_exact(&mut header).unwrap();
    let reply = CommandHeader::decode(&header);
    assert_eq!(reply.kind, CommandKind::ReplyPeek as u32);

    let mut bytes = [0u8; 32];
    stream.read_exact(&mut bytes).unwrap();
    assert_eq!(bytes.as_slice(), pattern.as_slice());
    assert_eq!(target.as_slice(), pattern.as_slice());
}

#[test]
fn dummy_block_reply_is_eight_nonzero_bytes() {
    let mut stream = connect();
    send_command(&mut stream, CommandKind::GetDummyBlock);
    assert_ne!(read_u64(&mut stream), 0);
}

#[test]
fn sessions_are_isolated_from_each_other() {
    let listener = Listener::bind(0).unwrap();
    let port = listener.local_port().unwrap();
    thread::spawn(move || {
        let _ = listener.run();
    });

    let mut violator = TcpStream::connect(("127.0.0.1", port)).unwrap();
    violator.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    read_banner(&mut violator);

    let mut healthy = TcpStream::connect(("127.0.0.1", port)).unwrap();
    healthy.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    read_banner(&mut healthy);

    // Kill the first session with a protocol violation.
    let bogus = CommandHeader {
        magic: 0xdead_beef,
        kind: 0,
    };
    violator.write_all(&bogus.encode()).unwrap();
    expect_clean_close(&mut violator);

    // The second session is unaffected and can run a full exec.
    send_exec(&mut healthy, false, &[b"/bin/echo".as_slice(), b"still here".as_slice()]);
    let pid = read_u32(&mut healthy);
    assert_ne!(pid, INVALID_PID);
    let (stdout, status) = read_exec_chunks(&mut healthy);
    assert!(stdout.starts_with(b"still here"));
    assert_eq!(status, 0);
}
