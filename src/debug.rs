use crate::chunk::{Chunk, Constant, Instruction, OpCode};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    for offset in 0..chunk.len() {
        disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) {
    print!("{:08} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("       | ");
    } else {
        print!("{:08} ", chunk.lines[offset]);
    }

    let instruction = chunk.code[offset];
    match instruction.op {
        OpCode::LoadConst | OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal => {
            constant_instruction(&instruction, chunk)
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            println!(
                "{:<16} {:>4} {:>6}",
                instruction.op.to_string(),
                instruction.a,
                instruction.sbx()
            );
        }
        _ => {
            println!(
                "{:<16} {:>4} {:>4} {:>4}",
                instruction.op.to_string(),
                instruction.a,
                instruction.b,
                instruction.c
            );
        }
    }
}

fn constant_instruction(instruction: &Instruction, chunk: &Chunk) {
    print!(
        "{:<16} {:>4} {:>4} '",
        instruction.op.to_string(),
        instruction.a,
        instruction.bx()
    );
    match chunk.constants.get(instruction.bx()) {
        Some(Constant::Nil) => print!("nil"),
        Some(Constant::Bool(b)) => print!("{}", b),
        Some(Constant::Number(n)) => print!("{}", crate::value::format_number(*n)),
        Some(Constant::Str(s)) => print!("{}", s),
        None => print!("??"),
    }
    println!("'");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembles_without_panicking() {
        let mut chunk = Chunk::new();
        let k = chunk.add_constant(Constant::Number(1.0)) as u16;
        chunk.emit(Instruction::abx(OpCode::LoadConst, 0, k), 1);
        chunk.emit(Instruction::asbx(OpCode::Jump, 0, -1), 1);
        chunk.emit(Instruction::abc(OpCode::Return, 0, 1, 0), 2);
        disassemble_chunk(&chunk, "test chunk");
    }
}
