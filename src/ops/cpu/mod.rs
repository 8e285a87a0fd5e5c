pub mod stick_breaking;
