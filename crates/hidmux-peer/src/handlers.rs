//! Built-in remote methods.
//!
//! Argument and result layouts (all integers big-endian, strings
//! NUL-terminated):
//!
//! | method | args | result |
//! |---|---|---|
//! | `echo` | any | the args |
//! | `create_proc` | `[u8 use_channels][program][args]` | `[u32 pid][u8 use_channels][u32 stdin][u32 stdout][u32 stderr]` |
//! | `kill_proc` | `[u32 pid]` | `[u32 pid]` |
//! | `pwd` | none | working directory |
//! | `cd` | `[dir]` | new working directory or failure text |
//! | `ls` | `[dir]` | entry names, one per line, or failure text |
//! | `open_file` | `[path][mode][u8 force]` | `[u32 channel]` |
//! | `open_stream` | `[path][mode][u8 force][u8 passthrough]` | `[u32 channel]` |

use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use hidmux_frame::WireRead;

use crate::channel::{FileAccessMode, FileChannel, StreamChannel};
use crate::fs;
use crate::method::{MethodContext, MethodError, MethodResult, MethodTable};

/// A table holding every built-in method.
pub fn builtin_methods() -> MethodTable {
    let mut table = MethodTable::new();
    table
        .register("echo", echo)
        .register("create_proc", create_proc)
        .register("kill_proc", kill_proc)
        .register("pwd", pwd)
        .register("cd", cd)
        .register("ls", ls)
        .register("open_file", open_file)
        .register("open_stream", open_stream);
    table
}

fn echo(_: &MethodContext<'_>, args: Bytes) -> MethodResult {
    Ok(args)
}

fn create_proc(ctx: &MethodContext<'_>, mut args: Bytes) -> MethodResult {
    let use_channels = args.take_u8()? != 0;
    let program = args.take_cstring()?;
    let program_args = args.take_cstring()?;

    let (pid, channels) = ctx
        .processes
        .spawn(ctx, &program, &program_args, use_channels)?;

    let mut out = BytesMut::with_capacity(17);
    out.put_u32(pid);
    out.put_u8(u8::from(channels.is_some()));
    match channels {
        Some(channels) => {
            out.put_u32(channels.stdin);
            out.put_u32(channels.stdout);
            out.put_u32(channels.stderr);
        }
        None => out.put_bytes(0, 12),
    }
    Ok(out.freeze())
}

fn kill_proc(ctx: &MethodContext<'_>, mut args: Bytes) -> MethodResult {
    let pid = args.take_u32()?;
    if !ctx.processes.kill(pid)? {
        return Err(MethodError::failed(format!("Process with ID {pid} not known")));
    }
    Ok(Bytes::copy_from_slice(&pid.to_be_bytes()))
}

fn pwd(_: &MethodContext<'_>, _: Bytes) -> MethodResult {
    Ok(Bytes::from(fs::pwd()))
}

fn cd(_: &MethodContext<'_>, mut args: Bytes) -> MethodResult {
    let target = args.take_cstring()?;
    Ok(Bytes::from(fs::cd(&target)))
}

fn ls(_: &MethodContext<'_>, mut args: Bytes) -> MethodResult {
    let dir = if args.is_empty() {
        String::new()
    } else {
        args.take_cstring()?
    };
    Ok(Bytes::from(fs::ls(&dir)))
}

fn open_file(ctx: &MethodContext<'_>, mut args: Bytes) -> MethodResult {
    let path = args.take_cstring()?;
    let mode = args.take_cstring()?;
    let force = args.take_u8()? != 0;

    let channel = FileChannel::open(
        ctx.transport.channel_context(),
        path,
        &mode,
        force,
        &ctx.config.file,
    )?;
    let id = ctx.open_channel(Arc::new(channel));
    Ok(Bytes::copy_from_slice(&id.to_be_bytes()))
}

fn open_stream(ctx: &MethodContext<'_>, mut args: Bytes) -> MethodResult {
    let path = args.take_cstring()?;
    let mode = FileAccessMode::parse(&args.take_cstring()?)?;
    let force = args.take_u8()? != 0;
    let passthrough = args.take_u8()? != 0;

    let channel = StreamChannel::open_file(
        ctx.transport.channel_context(),
        Path::new(&path),
        mode,
        ctx.config.file.protect_existing && !force,
        passthrough,
        ctx.config.stream.clone(),
    )?;
    let id = ctx.open_channel(Arc::new(channel));
    Ok(Bytes::copy_from_slice(&id.to_be_bytes()))
}
