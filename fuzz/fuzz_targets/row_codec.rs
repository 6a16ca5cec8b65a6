// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![no_main]

use arbitrary::Arbitrary;
use crund::{Charset, Entity, Row, RowCodec, Transcoder};
use libfuzzer_sys::fuzz_target;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const MAX_LEN: usize = 64;

#[derive(Arbitrary, Debug)]
struct Input {
    latin1: bool,
    child: bool,
    id: i32,
    cint: Option<i32>,
    clong: Option<i64>,
    cfloat: Option<f32>,
    cdouble: Option<f64>,
    aid: Option<i32>,
    cvarbinary: Option<Vec<u8>>,
    cvarchar: Option<String>,
    garbage: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let charset = if input.latin1 {
        Charset::Latin1
    } else {
        Charset::Utf8
    };
    let entity = if input.child { Entity::B } else { Entity::A };
    let mut codec = RowCodec::new(entity, MAX_LEN, MAX_LEN, Transcoder::new(charset));

    // arbitrary bytes decode or fail, never panic
    _ = codec.decode(&input.garbage);

    let mut row = Row::new(input.id);
    row.cint = input.cint;
    row.clong = input.clong;
    row.cfloat = input.cfloat;
    row.cdouble = input.cdouble;
    if entity == Entity::B {
        row.aid = input.aid;
        row.cvarbinary = input.cvarbinary;
        row.cvarchar = input.cvarchar;
    }

    // rows the codec accepts come back bit-identical
    if let Ok(bytes) = codec.encode(&row) {
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.id, row.id);
        assert_eq!(decoded.cint, row.cint);
        assert_eq!(decoded.clong, row.clong);
        assert_eq!(decoded.cfloat.map(f32::to_bits), row.cfloat.map(f32::to_bits));
        assert_eq!(decoded.cdouble.map(f64::to_bits), row.cdouble.map(f64::to_bits));
        assert_eq!(decoded.aid, row.aid);
        assert_eq!(decoded.cvarbinary, row.cvarbinary);
        assert_eq!(decoded.cvarchar, row.cvarchar);
    }
});
