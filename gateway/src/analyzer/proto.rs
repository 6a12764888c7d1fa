#![allow(clippy::all)]
tonic::include_proto!("analyzer.v1");
